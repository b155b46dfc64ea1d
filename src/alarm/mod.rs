//! The alarms subsystem: alarms, conditions, tests, actions, profiles, the
//! manager, and the audit logger.
//!
//! Ownership is arena-style: the [`manager::Manager`] owns every alarm in a
//! map keyed by [`AlarmId`]; children refer to parents by id and deferred
//! callbacks travel through the manager's event queue, so there are no
//! reference cycles anywhere in the tree.

pub mod actions;
pub mod condition;
pub mod logger;
pub mod manager;
pub mod profile;

use std::collections::{BTreeMap, VecDeque};

use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::clock::{Clock, TimerWheel};
use crate::error::ConfigError;
use crate::expr::{Expression, TokenFactory};
use crate::source::{DataSources, Record, Request, SinkFailure};
use crate::value::Operand;
use crate::xml::Element;

use actions::{ActionInstance, ActionKind, ActionPayload};
use condition::{expand_template, Condition, RenderVars};
use profile::EmailProfile;
use test::AlarmTest;

/// Runtime identity of an alarm; doubles as its data-source sink id.
pub type AlarmId = u64;

/// Oldest ignore entries are dropped past this depth so a forward action
/// whose write-backs silently fail cannot grow the backlog without bound.
pub const IGNORE_BACKLOG_CAP: usize = 16;

/// Everything a one-shot timer can be armed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTarget {
    /// No-data watchdog for one condition.
    NoData { alarm: AlarmId, condition: usize },
    /// Initial-delay / repeat-interval timer for one action template.
    ActionDelay {
        alarm: AlarmId,
        condition: usize,
        template: usize,
    },
    /// Time-based log baling.
    LogBale,
}

/// Application hooks: state-change notification, value observation, and
/// custom `%X` expansion in action payload templates.
pub trait AlarmClient: Send {
    fn on_alarm_change(&mut self, _alarm: AlarmId) {}
    fn on_last_value_changed(&mut self, _alarm: AlarmId, _value: &Operand) {}
    fn on_log_event(&mut self, _event: &Element) {}
    fn expand_format(&mut self, _alarm: AlarmId, _key: char) -> Option<String> {
        None
    }
    fn format_value_units(&mut self, _alarm: AlarmId) -> String {
        String::new()
    }
}

/// Default client: ignores everything.
#[derive(Debug, Default)]
pub struct NullClient;

impl AlarmClient for NullClient {}

/// Trigger/acknowledge state reported on the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmState {
    Off,
    On,
    Acknowledged,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Off => "off",
            AlarmState::On => "on",
            AlarmState::Acknowledged => "acknowledged",
        }
    }
}

/// Mutable engine context threaded through alarm calls: the shared timer,
/// the source layer, the client, and the manager's log/action outboxes.
/// Collecting side effects here keeps parent/child calls cycle-free.
pub(crate) struct Ctx<'a> {
    pub clock: &'a dyn Clock,
    pub timer: &'a mut TimerWheel<TimerTarget>,
    pub sources: &'a mut dyn DataSources,
    pub client: &'a mut dyn AlarmClient,
    /// Log events emitted during this dispatch, flushed by the manager.
    pub logs: &'a mut Vec<Element>,
    /// Action instances created during this dispatch.
    pub actions: &'a mut Vec<ActionInstance>,
    pub next_action_id: &'a mut u64,
    pub exec_allowed: bool,
    pub profiles: &'a BTreeMap<String, EmailProfile>,
}

/// One watched expression with its conditions and trigger state.
#[derive(Debug)]
pub struct Alarm {
    sink: AlarmId,
    name: String,
    id: String,
    latched: bool,
    source_text: String,
    source_expr: Option<Expression>,
    requests: Vec<Request>,
    for_table: bool,
    conditions: Vec<Condition>,
    triggered: Option<usize>,
    acknowledged: bool,
    last_value: Option<Operand>,
    last_error: String,
    last_action_error: String,
    actions_enabled: bool,
    ignore_requests: VecDeque<usize>,
    /// Forward actions swallow evaluation failures; this counts them so the
    /// silence is at least visible on the status surface.
    forward_eval_failures: u64,
}

impl Alarm {
    pub fn new(sink: AlarmId) -> Self {
        Self {
            sink,
            name: String::new(),
            id: Uuid::new_v4().to_string(),
            latched: false,
            source_text: String::new(),
            source_expr: None,
            requests: Vec::new(),
            for_table: false,
            conditions: Vec::new(),
            triggered: None,
            acknowledged: false,
            last_value: None,
            last_error: String::new(),
            last_action_error: String::new(),
            actions_enabled: true,
            ignore_requests: VecDeque::new(),
            forward_eval_failures: 0,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn sink(&self) -> AlarmId {
        self.sink
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn latched(&self) -> bool {
        self.latched
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    pub fn last_action_error(&self) -> &str {
        &self.last_action_error
    }

    pub fn last_value(&self) -> Option<&Operand> {
        self.last_value.as_ref()
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn state(&self) -> AlarmState {
        match (self.triggered.is_some(), self.acknowledged) {
            (true, false) => AlarmState::On,
            (true, true) => AlarmState::Acknowledged,
            (false, _) => AlarmState::Off,
        }
    }

    pub fn triggered_condition_name(&self) -> String {
        self.triggered
            .and_then(|i| self.conditions.get(i))
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    /// True when any condition's raw on-state is asserted, independent of
    /// latching and off expressions.
    pub fn has_on_condition(&self) -> bool {
        self.triggered.is_some()
            || self
                .conditions
                .iter()
                .any(|c| c.test.has_on_condition())
    }

    pub fn forward_eval_failures(&self) -> u64 {
        self.forward_eval_failures
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    pub fn read(&mut self, elem: &Element, factory: &TokenFactory) -> Result<(), ConfigError> {
        self.name = elem.require_attr("name")?.to_string();
        self.latched = elem.attr_bool("latched", false)?;
        if let Some(id) = elem.attr("id") {
            self.id = id.to_string();
        }
        let conditions_xml = elem.require("conditions")?;
        let mut conditions = Vec::new();
        for condition_xml in conditions_xml.children() {
            if condition_xml.name == "condition" {
                conditions.push(Condition::read(condition_xml, factory)?);
            }
        }
        let source_text = elem.require_text("source")?.to_string();
        let (expr, requests) = factory.make_expression(&source_text)?;
        self.conditions = conditions;
        self.source_text = source_text;
        self.source_expr = Some(expr);
        self.requests = requests;
        Ok(())
    }

    pub fn write(&self, elem: &mut Element) {
        elem.set_attr("name", &self.name);
        elem.set_attr("id", &self.id);
        elem.set_attr_bool("latched", self.latched);
        elem.add_element("source").set_text(&self.source_text);
        let conditions_xml = elem.add_element("conditions");
        for condition in &self.conditions {
            condition.write(conditions_xml.add_element("condition"));
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn start(&mut self, ctx: &mut Ctx) {
        if let Some(expr) = &mut self.source_expr {
            expr.reset_state();
        }
        self.last_value = None;
        self.last_error = "waiting for requests".to_string();
        self.for_table = false;
        self.triggered = None;
        self.acknowledged = false;
        self.ignore_requests.clear();
        ctx.sources.remove_requests(self.sink);
        for idx in 0..self.conditions.len() {
            let target = TimerTarget::NoData {
                alarm: self.sink,
                condition: idx,
            };
            self.conditions[idx]
                .test
                .on_started(ctx.timer, ctx.clock, target);
        }
        for request in &self.requests {
            ctx.sources.add_request(self.sink, request.clone());
        }
        ctx.sources.activate_requests();
    }

    pub(crate) fn stop(&mut self, ctx: &mut Ctx) {
        self.last_value = None;
        self.last_error.clear();
        self.for_table = false;
        self.ignore_requests.clear();
        ctx.sources.remove_requests(self.sink);
        for idx in 0..self.conditions.len() {
            self.conditions[idx].test.on_stopped(ctx.timer);
            self.disarm_actions(idx, ctx);
        }
        self.triggered = None;
        self.acknowledged = false;
    }

    pub(crate) fn enable_actions(&mut self, enabled: bool) {
        self.actions_enabled = enabled;
    }

    pub fn actions_enabled(&self) -> bool {
        self.actions_enabled
    }

    // ------------------------------------------------------------------
    // Sink notifications
    // ------------------------------------------------------------------

    pub(crate) fn on_sink_ready(&mut self, is_table: bool, ctx: &mut Ctx) {
        self.for_table = is_table;
        self.last_error.clear();
        ctx.client.on_alarm_change(self.sink);
    }

    pub(crate) fn on_sink_failure(&mut self, uri: &str, failure: &SinkFailure, ctx: &mut Ctx) {
        self.last_error = format!("request failure for \"{uri}\": {failure}");
        ctx.client.on_alarm_change(self.sink);
    }

    pub(crate) fn on_records(&mut self, records: &[Record], ctx: &mut Ctx) {
        self.last_error.clear();
        for record in records {
            let mut ignored = false;
            let matching: Vec<usize> = self
                .requests
                .iter()
                .enumerate()
                .filter(|(_, r)| r.table_uri() == record.table_uri)
                .map(|(i, _)| i)
                .collect();
            for req_idx in matching {
                if !self.for_table {
                    if let Some(expr) = &mut self.source_expr {
                        expr.assign_request_variables(record, req_idx);
                    }
                }
                if let Some(pos) = self.ignore_requests.iter().position(|&i| i == req_idx) {
                    ignored = true;
                    self.ignore_requests.remove(pos);
                }
            }
            if ignored {
                continue;
            }
            if !self.for_table {
                if let Some(expr) = &mut self.source_expr {
                    match expr.eval(ctx.clock) {
                        Ok(value) => {
                            ctx.client.on_last_value_changed(self.sink, &value);
                            self.last_value = Some(value);
                        }
                        Err(e) => {
                            self.last_error = format!("error evaluating source expression: {e}");
                        }
                    }
                }
            }
            self.process_record(Some(record), ctx);
        }
    }

    /// Queue the next record from the table behind `uri` for suppression.
    /// Forward actions call this after a successful write-back so the echo
    /// of their own write does not re-trigger the alarm.
    pub(crate) fn ignore_next_record(&mut self, uri: &str, sources: &dyn DataSources) {
        let table = sources.make_table_uri(uri);
        for (idx, request) in self.requests.iter().enumerate() {
            if sources.make_table_uri(&request.uri) == table {
                if self.ignore_requests.len() >= IGNORE_BACKLOG_CAP {
                    self.ignore_requests.pop_front();
                    warn!(
                        alarm = %self.name,
                        "[Alarm] ignore backlog exceeded {IGNORE_BACKLOG_CAP}; dropping oldest"
                    );
                }
                self.ignore_requests.push_back(idx);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn ignore_backlog_len(&self) -> usize {
        self.ignore_requests.len()
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    /// Poll every condition against the new record (or the null record a
    /// fired watchdog feeds back) and walk the trigger state machine.
    pub(crate) fn process_record(&mut self, record: Option<&Record>, ctx: &mut Ctx) {
        let mut triggered_now: Vec<usize> = Vec::new();
        let for_table = self.for_table;
        let sink = self.sink;
        for (idx, condition) in self.conditions.iter_mut().enumerate() {
            let hit = match &mut condition.test {
                AlarmTest::Data(data) => {
                    if for_table {
                        false
                    } else if let Some(value) = &self.last_value {
                        data.on_value(value, ctx.clock)
                    } else {
                        false
                    }
                }
                AlarmTest::NoData(_) => {
                    let target = TimerTarget::NoData {
                        alarm: sink,
                        condition: idx,
                    };
                    condition.test.on_record(record, ctx.timer, ctx.clock, target)
                }
            };
            if hit {
                triggered_now.push(idx);
            }
        }

        match self.triggered {
            Some(current) => {
                let still_triggered = triggered_now.contains(&current);
                let mut notify = true;
                // A latched alarm holds its triggered state across an
                // off-condition; it clears through acknowledge (or stop).
                if !still_triggered && !self.latched {
                    self.transition_off(ctx);
                    if let Some(&next) = triggered_now.first() {
                        self.triggered = Some(next);
                        self.transition_on(ctx);
                        notify = false;
                    }
                }
                if notify {
                    ctx.client.on_alarm_change(self.sink);
                }
            }
            None => match triggered_now.first() {
                Some(&first) => {
                    self.triggered = Some(first);
                    self.transition_on(ctx);
                }
                None => ctx.client.on_alarm_change(self.sink),
            },
        }

        // A constant off expression lets a condition clear within the same
        // batch (forwards fire once per entry this way); the client observes
        // both the on and the off state.
        if let Some(current) = self.triggered {
            let cleared = !self.conditions[current].is_triggered();
            if cleared && !self.latched {
                self.transition_off(ctx);
            }
        }
    }

    pub(crate) fn acknowledge(&mut self, comments: &str, ctx: &mut Ctx) {
        let Some(current) = self.triggered else {
            return;
        };
        if self.acknowledged {
            return;
        }
        self.acknowledged = true;
        let mut log = Element::new("alarm-acknowledged");
        {
            let condition_xml = log.add_element("condition");
            condition_xml.set_attr("name", &self.conditions[current].name);
            condition_xml
                .add_element("exit")
                .set_text(self.conditions[current].test.format_exit(self.latched));
        }
        log.add_element("source")
            .set_text(self.annotate_source_expression());
        log.add_element("comments").set_text(comments);
        self.add_log(log, ctx);
        self.disarm_actions(current, ctx);
        if !self.conditions[current].is_triggered() {
            self.acknowledged = false;
            self.transition_off(ctx);
        } else {
            ctx.client.on_alarm_change(self.sink);
        }
    }

    fn transition_on(&mut self, ctx: &mut Ctx) {
        let Some(current) = self.triggered else {
            return;
        };
        self.acknowledged = false;
        let mut log = Element::new("alarm-triggered");
        {
            let condition_xml = log.add_element("condition");
            condition_xml.set_attr("name", &self.conditions[current].name);
            condition_xml
                .add_element("entrance")
                .set_text(self.conditions[current].test.format_entrance());
        }
        log.add_element("source")
            .set_text(self.annotate_source_expression());
        self.add_log(log, ctx);
        self.arm_actions(current, ctx);
        ctx.client.on_alarm_change(self.sink);
    }

    fn transition_off(&mut self, ctx: &mut Ctx) {
        let Some(current) = self.triggered else {
            return;
        };
        self.acknowledged = false;
        let mut log = Element::new("alarm-off");
        {
            let condition_xml = log.add_element("condition");
            condition_xml.set_attr("name", &self.conditions[current].name);
            condition_xml
                .add_element("exit")
                .set_text(self.conditions[current].test.format_exit(self.latched));
        }
        log.add_element("source")
            .set_text(self.annotate_source_expression());
        self.add_log(log, ctx);
        self.disarm_actions(current, ctx);
        self.triggered = None;
        ctx.client.on_alarm_change(self.sink);
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    fn arm_actions(&mut self, cond_idx: usize, ctx: &mut Ctx) {
        for tmpl_idx in 0..self.conditions[cond_idx].actions.len() {
            let (initial_delay, interval) = {
                let template = &self.conditions[cond_idx].actions[tmpl_idx];
                (template.initial_delay, template.interval)
            };
            let target = TimerTarget::ActionDelay {
                alarm: self.sink,
                condition: cond_idx,
                template: tmpl_idx,
            };
            if initial_delay != 0 {
                let id = ctx.timer.arm(target, initial_delay, ctx.clock.now());
                self.conditions[cond_idx].actions[tmpl_idx].delay_id = Some(id);
            } else {
                self.perform_action(cond_idx, tmpl_idx, ctx);
                if interval != 0 {
                    let id = ctx.timer.arm(target, interval, ctx.clock.now());
                    self.conditions[cond_idx].actions[tmpl_idx].delay_id = Some(id);
                }
            }
        }
    }

    fn disarm_actions(&mut self, cond_idx: usize, ctx: &mut Ctx) {
        for template in &mut self.conditions[cond_idx].actions {
            if let Some(id) = template.delay_id.take() {
                ctx.timer.disarm(id);
            }
        }
    }

    /// The no-data watchdog for one condition fired: the test clears its
    /// timer and the alarm re-evaluates with a null record.
    pub(crate) fn on_nodata_timer(
        &mut self,
        cond_idx: usize,
        timer_id: crate::clock::TimerId,
        ctx: &mut Ctx,
    ) {
        let fired = self
            .conditions
            .get_mut(cond_idx)
            .is_some_and(|c| c.test.on_timer_fired(timer_id));
        if fired {
            self.process_record(None, ctx);
        }
    }

    /// The delay/interval timer for one template fired: clear the id, fire
    /// the action, and re-arm when a repeat interval is configured.
    pub(crate) fn on_action_timer(&mut self, cond_idx: usize, tmpl_idx: usize, ctx: &mut Ctx) {
        let Some(template) = self
            .conditions
            .get_mut(cond_idx)
            .and_then(|c| c.actions.get_mut(tmpl_idx))
        else {
            return;
        };
        template.delay_id = None;
        let interval = template.interval;
        self.perform_action(cond_idx, tmpl_idx, ctx);
        if interval != 0 {
            let target = TimerTarget::ActionDelay {
                alarm: self.sink,
                condition: cond_idx,
                template: tmpl_idx,
            };
            let id = ctx.timer.arm(target, interval, ctx.clock.now());
            self.conditions[cond_idx].actions[tmpl_idx].delay_id = Some(id);
        }
    }

    /// Instantiate one action from its template and hand it to the manager
    /// queue (via the context outbox), logging `action-started`.
    fn perform_action(&mut self, cond_idx: usize, tmpl_idx: usize, ctx: &mut Ctx) {
        if !self.actions_enabled {
            return;
        }
        let vars = self.render_vars(cond_idx, ctx.client);
        let payload = {
            let last_value = self.last_value.clone();
            let Some(template) = self
                .conditions
                .get_mut(cond_idx)
                .and_then(|c| c.actions.get_mut(tmpl_idx))
            else {
                return;
            };
            match &mut template.kind {
                ActionKind::Email {
                    profile,
                    subject,
                    body,
                    attachment,
                } => ActionPayload::Email {
                    profile: profile.clone(),
                    subject: expand_template(subject, &vars, ctx.client, self.sink),
                    message: expand_template(body, &vars, ctx.client, self.sink),
                    attachment: attachment.clone(),
                },
                ActionKind::Exec { command } => {
                    if !ctx.exec_allowed {
                        warn!(
                            alarm = %self.name,
                            "[Alarm] exec action suppressed: exec actions are not allowed"
                        );
                        return;
                    }
                    ActionPayload::Exec {
                        command: expand_template(command, &vars, ctx.client, self.sink),
                    }
                }
                ActionKind::Forward {
                    expression,
                    dest_uri,
                    ..
                } => {
                    let Some(value) = last_value else {
                        self.forward_eval_failures += 1;
                        warn!(
                            alarm = %self.name,
                            "[Alarm] forward action skipped: no source value yet"
                        );
                        return;
                    };
                    expression.set_all_variables(&value);
                    match expression.eval(ctx.clock) {
                        Ok(out) => ActionPayload::Forward {
                            uri: dest_uri.clone(),
                            value: out.value,
                        },
                        Err(e) => {
                            self.forward_eval_failures += 1;
                            warn!(
                                alarm = %self.name,
                                "[Alarm] forward expression failed (swallowed): {e}"
                            );
                            return;
                        }
                    }
                }
            }
        };
        let id = *ctx.next_action_id;
        *ctx.next_action_id += 1;
        let instance = ActionInstance {
            id,
            alarm: self.sink,
            alarm_name: self.name.clone(),
            condition_name: self.conditions[cond_idx].name.clone(),
            entrance: vars.entrance.clone(),
            payload,
            complete: false,
            last_error: String::new(),
        };
        let mut log = Element::new("action-started");
        {
            let condition_xml = log.add_element("condition");
            condition_xml.set_attr("name", &instance.condition_name);
            condition_xml
                .add_element("entrance")
                .set_text(&instance.entrance);
        }
        {
            let action_xml = log.add_element("action");
            action_xml.set_attr("type", instance.type_name());
            let profile_name = match &instance.payload {
                ActionPayload::Email { profile, .. } => {
                    ctx.profiles.get(profile).map(|p| p.name.clone())
                }
                _ => None,
            };
            instance.describe_log(action_xml, profile_name.as_deref());
        }
        self.add_log(log, ctx);
        ctx.actions.push(instance);
    }

    pub(crate) fn record_action_error(&mut self, error: &str) {
        self.last_action_error = error.to_string();
    }

    // ------------------------------------------------------------------
    // Formatting
    // ------------------------------------------------------------------

    pub fn annotate_source_expression(&self) -> String {
        match &self.source_expr {
            Some(expr) => expr.annotate_source(),
            None => self.source_text.clone(),
        }
    }

    fn render_vars(&self, cond_idx: usize, client: &mut dyn AlarmClient) -> RenderVars {
        let condition = &self.conditions[cond_idx];
        let value_operand = self
            .last_value
            .as_ref()
            .or_else(|| condition.test.last_on_value());
        RenderVars {
            alarm_name: self.name.clone(),
            annotated_source: self.annotate_source_expression(),
            value: value_operand
                .map(|v| v.value.to_string())
                .unwrap_or_else(|| "NAN".to_string()),
            value_units: client.format_value_units(self.sink),
            value_time: value_operand
                .map(|v| v.stamp.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            entrance: condition.test.format_entrance(),
            exit: condition.test.format_exit(self.latched),
            condition_name: condition.name.clone(),
        }
    }

    fn add_log(&self, mut elem: Element, ctx: &mut Ctx) {
        elem.set_attr("name", &self.name);
        ctx.logs.push(elem);
    }

    /// Status snapshot for UIs and remote clients.
    pub fn format_json(&self, pending_actions: u32) -> serde_json::Value {
        json!({
            "name": self.name,
            "id": self.id,
            "value": self
                .last_value
                .as_ref()
                .map(|v| v.value.to_string())
                .unwrap_or_else(|| "NAN".to_string()),
            "value_type": self
                .last_value
                .as_ref()
                .map(Operand::value_type_name)
                .unwrap_or("xsd:double"),
            "state": self.state().as_str(),
            "last_error": self.last_error,
            "triggered_condition_name": self.triggered_condition_name(),
            "actions_pending": pending_actions,
            "last_action_error": self.last_action_error,
            "forward_eval_failures": self.forward_eval_failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::TokenFactory;
    use crate::source::SimSources;
    use crate::xml::Element;

    fn configured_alarm() -> Alarm {
        let doc = r#"<alarm name="Clamp">
  <source>station.public.X</source>
  <conditions>
    <condition name="negative">
      <test type="data"><on-expr>X &lt; 0</on-expr></test>
      <actions></actions>
    </condition>
  </conditions>
</alarm>"#;
        let elem = Element::parse(doc).unwrap();
        let mut alarm = Alarm::new(1);
        alarm.read(&elem, &TokenFactory::default()).unwrap();
        alarm
    }

    #[test]
    fn ignore_backlog_is_bounded() {
        let mut alarm = configured_alarm();
        let sources = SimSources::new();
        for _ in 0..IGNORE_BACKLOG_CAP + 8 {
            alarm.ignore_next_record("station.public.X", &sources);
        }
        assert_eq!(alarm.ignore_backlog_len(), IGNORE_BACKLOG_CAP);
    }

    #[test]
    fn ignore_matches_by_table_uri() {
        let mut alarm = configured_alarm();
        let sources = SimSources::new();
        // a column URI from a different table matches nothing
        alarm.ignore_next_record("station.other.X", &sources);
        assert_eq!(alarm.ignore_backlog_len(), 0);
        // any column of the subscribed table matches its request
        alarm.ignore_next_record("station.public.Y", &sources);
        assert_eq!(alarm.ignore_backlog_len(), 1);
    }

    #[test]
    fn json_snapshot_reports_state_and_counters() {
        let alarm = configured_alarm();
        let json = alarm.format_json(2);
        assert_eq!(json["name"], "Clamp");
        assert_eq!(json["state"], "off");
        assert_eq!(json["value"], "NAN");
        assert_eq!(json["actions_pending"], 2);
        assert_eq!(json["forward_eval_failures"], 0);
    }
}
