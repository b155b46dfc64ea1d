//! A named condition: one test plus its ordered action templates.

use crate::error::ConfigError;
use crate::expr::TokenFactory;
use crate::xml::Element;

use super::actions::ActionTemplate;
use super::test::AlarmTest;
use super::{AlarmClient, AlarmId};

#[derive(Debug)]
pub struct Condition {
    pub name: String,
    pub test: AlarmTest,
    pub actions: Vec<ActionTemplate>,
}

impl Condition {
    pub fn read(elem: &Element, factory: &TokenFactory) -> Result<Self, ConfigError> {
        let name = elem.attr("name").unwrap_or_default().to_string();
        let test = AlarmTest::read(elem.require("test")?, factory)?;
        let mut actions = Vec::new();
        for action_xml in elem.require("actions")?.children() {
            actions.push(ActionTemplate::read(action_xml, factory)?);
        }
        Ok(Self {
            name,
            test,
            actions,
        })
    }

    pub fn write(&self, elem: &mut Element) {
        elem.set_attr("name", &self.name);
        self.test.write(elem.add_element("test"));
        let actions_xml = elem.add_element("actions");
        for action in &self.actions {
            action.write(actions_xml.add_element("action"));
        }
    }

    pub fn is_triggered(&mut self) -> bool {
        self.test.is_triggered()
    }
}

/// Values substituted into email subjects/bodies and exec command lines.
///
/// Snapshot of the alarm at render time so a template never needs to reach
/// back into live engine state.
#[derive(Debug, Clone, Default)]
pub struct RenderVars {
    pub alarm_name: String,
    pub annotated_source: String,
    pub value: String,
    pub value_units: String,
    pub value_time: String,
    pub entrance: String,
    pub exit: String,
    pub condition_name: String,
}

/// Expand a format template: `%n` alarm name, `%s` annotated source, `%v`
/// value, `%u` units, `%t` value time, `%e` entrance, `%x` exit, `%c`
/// condition name, `%%` literal percent. Any other `%X` is offered to the
/// alarm client before being passed through verbatim.
pub fn expand_template(
    fmt: &str,
    vars: &RenderVars,
    client: &mut dyn AlarmClient,
    alarm: AlarmId,
) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        let Some(&key) = chars.peek() else {
            out.push('%');
            break;
        };
        chars.next();
        match key.to_ascii_lowercase() {
            '%' => out.push('%'),
            'n' => out.push_str(&vars.alarm_name),
            's' => out.push_str(&vars.annotated_source),
            'v' => out.push_str(&vars.value),
            'u' => out.push_str(&vars.value_units),
            't' => out.push_str(&vars.value_time),
            'e' => out.push_str(&vars.entrance),
            'x' => out.push_str(&vars.exit),
            'c' => out.push_str(&vars.condition_name),
            _ => match client.expand_format(alarm, key) {
                Some(expansion) => out.push_str(&expansion),
                None => {
                    out.push('%');
                    out.push(key);
                }
            },
        }
    }
    out
}
