//! Action templates (static parameters + throttling) and action instances
//! (one per condition firing, queued on the manager).

use crate::clock::TimerId;
use crate::error::ConfigError;
use crate::expr::{Expression, TokenFactory};
use crate::value::Value;
use crate::xml::Element;

use super::AlarmId;

/// How an action fires: delay/repeat timers plus the type-specific payload
/// parameters. One shared `delay_id` carries both the initial delay and the
/// repeat interval, matching the engine's single-timer discipline.
#[derive(Debug)]
pub struct ActionTemplate {
    pub initial_delay: u32,
    pub interval: u32,
    pub kind: ActionKind,
    pub(crate) delay_id: Option<TimerId>,
}

#[derive(Debug)]
pub enum ActionKind {
    Email {
        /// Unique id of the referenced email profile.
        profile: String,
        subject: String,
        body: String,
        attachment: Option<String>,
    },
    Forward {
        expression_source: String,
        expression: Expression,
        dest_uri: String,
    },
    Exec {
        command: String,
    },
}

impl ActionTemplate {
    pub fn read(elem: &Element, factory: &TokenFactory) -> Result<Self, ConfigError> {
        let kind = match elem.require_attr("type")? {
            "email" => ActionKind::Email {
                profile: elem.require_attr("profile")?.to_string(),
                subject: elem.require_text("subject")?.to_string(),
                body: elem.require_text("body")?.to_string(),
                attachment: elem.find("attachment").map(|a| a.text().to_string()),
            },
            "forward" => {
                let expression_source = elem.require_text("forward-expression")?.to_string();
                let (expression, _) = factory.make_expression(&expression_source)?;
                ActionKind::Forward {
                    expression_source,
                    expression,
                    dest_uri: elem.require_text("dest-uri")?.to_string(),
                }
            }
            "exec" => ActionKind::Exec {
                command: elem.require_text("command")?.to_string(),
            },
            other => return Err(ConfigError::UnknownActionType(other.to_string())),
        };
        Ok(Self {
            initial_delay: elem.attr_u32("initial-delay")?.unwrap_or(0),
            interval: elem.attr_u32("interval")?.unwrap_or(0),
            kind,
            delay_id: None,
        })
    }

    pub fn write(&self, elem: &mut Element) {
        elem.set_attr("type", self.type_name());
        elem.set_attr("initial-delay", self.initial_delay.to_string());
        elem.set_attr("interval", self.interval.to_string());
        match &self.kind {
            ActionKind::Email {
                profile,
                subject,
                body,
                attachment,
            } => {
                elem.set_attr("profile", profile);
                elem.add_element("subject").set_text(subject);
                elem.add_element("body").set_text(body);
                if let Some(attachment) = attachment {
                    elem.add_element("attachment").set_text(attachment);
                }
            }
            ActionKind::Forward {
                expression_source,
                dest_uri,
                ..
            } => {
                elem.add_element("forward-expression")
                    .set_text(expression_source);
                elem.add_element("dest-uri").set_text(dest_uri);
            }
            ActionKind::Exec { command } => {
                elem.add_element("command").set_text(command);
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            ActionKind::Email { .. } => "email",
            ActionKind::Forward { .. } => "forward",
            ActionKind::Exec { .. } => "exec",
        }
    }
}

/// Fully rendered payload for one action execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    Email {
        profile: String,
        subject: String,
        message: String,
        attachment: Option<String>,
    },
    Forward {
        uri: String,
        value: Value,
    },
    Exec {
        command: String,
    },
}

/// One queued (or running) execution of an action template.
#[derive(Debug, Clone)]
pub struct ActionInstance {
    pub id: u64,
    pub alarm: AlarmId,
    pub alarm_name: String,
    pub condition_name: String,
    /// Entrance text captured when the instance was created.
    pub entrance: String,
    pub payload: ActionPayload,
    pub complete: bool,
    pub last_error: String,
}

impl ActionInstance {
    pub fn type_name(&self) -> &'static str {
        match self.payload {
            ActionPayload::Email { .. } => "email",
            ActionPayload::Forward { .. } => "forward",
            ActionPayload::Exec { .. } => "exec",
        }
    }

    /// Describe this action for the `action-started` / `action-complete`
    /// log events. The `<outcome>` child appears once the action has
    /// completed: `success` iff no error was recorded.
    pub fn describe_log(&self, elem: &mut Element, profile_name: Option<&str>) {
        match &self.payload {
            ActionPayload::Email { message, .. } => {
                elem.set_attr("profile", profile_name.unwrap_or("unrecognised profile"));
                elem.add_element("message").set_text(message);
            }
            ActionPayload::Forward { uri, value } => {
                elem.set_attr("uri", uri);
                elem.set_attr("value", value.to_string());
            }
            ActionPayload::Exec { command } => {
                elem.add_element("command").set_text(command);
            }
        }
        if self.complete {
            let outcome = elem.add_element("outcome");
            if self.last_error.is_empty() {
                outcome.set_text("success");
            } else {
                outcome.set_text(format!("failure: {}", self.last_error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email_template_xml() -> Element {
        let mut elem = Element::new("action");
        elem.set_attr("type", "email");
        elem.set_attr("profile", "p-1");
        elem.set_attr("initial-delay", "250");
        elem.add_element("subject").set_text("%n triggered");
        elem.add_element("body").set_text("value %v");
        elem
    }

    #[test]
    fn reads_email_template() {
        let factory = TokenFactory::default();
        let template = ActionTemplate::read(&email_template_xml(), &factory).unwrap();
        assert_eq!(template.type_name(), "email");
        assert_eq!(template.initial_delay, 250);
        assert_eq!(template.interval, 0);
    }

    #[test]
    fn unknown_type_is_config_error() {
        let factory = TokenFactory::default();
        let mut elem = Element::new("action");
        elem.set_attr("type", "pager");
        assert!(matches!(
            ActionTemplate::read(&elem, &factory),
            Err(ConfigError::UnknownActionType(t)) if t == "pager"
        ));
    }

    #[test]
    fn template_round_trips_through_xml() {
        let factory = TokenFactory::default();
        let template = ActionTemplate::read(&email_template_xml(), &factory).unwrap();
        let mut written = Element::new("action");
        template.write(&mut written);
        let again = ActionTemplate::read(&written, &factory).unwrap();
        assert_eq!(again.initial_delay, template.initial_delay);
        assert_eq!(again.type_name(), "email");
    }

    #[test]
    fn outcome_child_reports_success_iff_no_error() {
        let mut instance = ActionInstance {
            id: 1,
            alarm: 1,
            alarm_name: "a".into(),
            condition_name: "c".into(),
            entrance: String::new(),
            payload: ActionPayload::Forward {
                uri: "logger.t.SetPoint".into(),
                value: Value::Int(0),
            },
            complete: true,
            last_error: String::new(),
        };
        let mut elem = Element::new("action");
        instance.describe_log(&mut elem, None);
        assert_eq!(elem.require_text("outcome").unwrap(), "success");

        instance.last_error = "invalid destination URI".into();
        let mut elem = Element::new("action");
        instance.describe_log(&mut elem, None);
        assert_eq!(
            elem.require_text("outcome").unwrap(),
            "failure: invalid destination URI"
        );
    }
}
