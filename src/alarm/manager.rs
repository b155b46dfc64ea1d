//! The manager: owns every alarm, the profile map, the serial action queue,
//! the shared timer wheel, and the audit logger.
//!
//! All engine state lives on one task. External completions (source records,
//! SMTP outcomes, process exits, timer fires) arrive as [`EngineEvent`]s and
//! are dispatched here in FIFO order. Deferred callbacks are keyed by id; if
//! the target is gone by dispatch time the event is dropped.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::clock::{SharedClock, TimerId, TimerWheel};
use crate::error::ConfigError;
use crate::expr::TokenFactory;
use crate::source::{DataSources, SetOutcome, SourceEvent};
use crate::xml::Element;

use super::actions::{ActionInstance, ActionPayload};
use super::logger::AlarmLogger;
use super::profile::EmailProfile;
use super::{Alarm, AlarmClient, AlarmId, Ctx, NullClient, TimerTarget};

/// Events posted to the engine loop by sources, executors, and timers.
#[derive(Debug)]
pub enum EngineEvent {
    Source(SourceEvent),
    /// An action instance finished; `error` is its failure text if any.
    ActionComplete { action: u64, error: Option<String> },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<EngineEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<EngineEvent>;

/// A resolved email send: profile credentials plus rendered content.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailRequest {
    pub profile: EmailProfile,
    pub subject: String,
    pub message: String,
    /// Attachment file references.
    pub attachments: Vec<String>,
}

/// Carries out email actions. The production transport drives the SMTP
/// sender (or the HTTP gateway) on a background task and posts
/// `ActionComplete` when the exchange finishes.
pub trait EmailTransport: Send {
    fn send(&mut self, action: u64, request: EmailRequest, done: EventSender);
}

/// Launches exec actions. The production launcher spawns the process and
/// posts `ActionComplete` with its exit status.
pub trait ProcessLauncher: Send {
    fn launch(&mut self, action: u64, command: String, done: EventSender);
}

/// Placeholder transport used until a real one is installed.
#[derive(Debug, Default)]
pub struct NoEmailTransport;

impl EmailTransport for NoEmailTransport {
    fn send(&mut self, action: u64, _request: EmailRequest, done: EventSender) {
        let _ = done.send(EngineEvent::ActionComplete {
            action,
            error: Some("no email transport configured".to_string()),
        });
    }
}

/// Placeholder launcher used until a real one is installed.
#[derive(Debug, Default)]
pub struct NoProcessLauncher;

impl ProcessLauncher for NoProcessLauncher {
    fn launch(&mut self, action: u64, _command: String, done: EventSender) {
        let _ = done.send(EngineEvent::ActionComplete {
            action,
            error: Some("no process launcher configured".to_string()),
        });
    }
}

pub struct Manager {
    clock: SharedClock,
    factory: TokenFactory,
    sources: Box<dyn DataSources>,
    timer: TimerWheel<TimerTarget>,
    alarms: BTreeMap<AlarmId, Alarm>,
    next_sink: AlarmId,
    profiles: BTreeMap<String, EmailProfile>,
    queue: VecDeque<ActionInstance>,
    current_action: Option<ActionInstance>,
    next_action_id: u64,
    exec_actions_allowed: bool,
    logger: Option<AlarmLogger>,
    log_bale_timer: Option<TimerId>,
    was_started: bool,
    alarm_log_dir: Option<PathBuf>,
    client: Box<dyn AlarmClient>,
    email: Box<dyn EmailTransport>,
    exec: Box<dyn ProcessLauncher>,
    events_tx: EventSender,
    // per-dispatch outboxes, drained by flush_effects
    pending_logs: Vec<Element>,
    pending_actions: Vec<ActionInstance>,
}

impl Manager {
    pub fn new(clock: SharedClock, sources: Box<dyn DataSources>, events_tx: EventSender) -> Self {
        Self {
            clock,
            factory: TokenFactory::default(),
            sources,
            timer: TimerWheel::new(),
            alarms: BTreeMap::new(),
            next_sink: 1,
            profiles: BTreeMap::new(),
            queue: VecDeque::new(),
            current_action: None,
            next_action_id: 1,
            exec_actions_allowed: true,
            logger: None,
            log_bale_timer: None,
            was_started: false,
            alarm_log_dir: None,
            client: Box::new(NullClient),
            email: Box::new(NoEmailTransport),
            exec: Box::new(NoProcessLauncher),
            events_tx,
            pending_logs: Vec::new(),
            pending_actions: Vec::new(),
        }
    }

    pub fn set_client(&mut self, client: Box<dyn AlarmClient>) {
        self.client = client;
    }

    pub fn set_email_transport(&mut self, transport: Box<dyn EmailTransport>) {
        self.email = transport;
    }

    pub fn set_process_launcher(&mut self, launcher: Box<dyn ProcessLauncher>) {
        self.exec = launcher;
    }

    pub fn exec_actions_allowed(&self) -> bool {
        self.exec_actions_allowed
    }

    pub fn set_exec_actions_allowed(&mut self, allowed: bool) {
        self.exec_actions_allowed = allowed;
    }

    pub fn was_started(&self) -> bool {
        self.was_started
    }

    /// Overrides the `directory` attribute of the log configuration block.
    pub fn set_alarm_log_dir(&mut self, dir: impl Into<PathBuf>) {
        self.alarm_log_dir = Some(dir.into());
    }

    pub fn token_factory(&self) -> &TokenFactory {
        &self.factory
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    // ------------------------------------------------------------------
    // Alarm container
    // ------------------------------------------------------------------

    pub fn alarms(&self) -> impl Iterator<Item = &Alarm> {
        self.alarms.values()
    }

    pub fn alarm(&self, id: AlarmId) -> Option<&Alarm> {
        self.alarms.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    /// Find an alarm by display name or configured GUID.
    pub fn find_alarm(&self, name_or_id: &str) -> Option<AlarmId> {
        self.alarms
            .iter()
            .find(|(_, a)| a.name() == name_or_id || a.id() == name_or_id)
            .map(|(id, _)| *id)
    }

    /// Add a configured alarm element; starts it when the manager runs.
    pub fn add_alarm(&mut self, elem: &Element) -> Result<AlarmId, ConfigError> {
        let sink = self.next_sink;
        self.next_sink += 1;
        let mut alarm = Alarm::new(sink);
        alarm.read(elem, &self.factory)?;
        self.alarms.insert(sink, alarm);
        if self.was_started {
            self.with_alarm(sink, |alarm, ctx| alarm.start(ctx));
        }
        Ok(sink)
    }

    pub fn remove_alarm(&mut self, id: AlarmId) {
        self.remove_actions_for_alarm(id);
        if self.was_started {
            self.with_alarm(id, |alarm, ctx| alarm.stop(ctx));
        }
        self.alarms.remove(&id);
    }

    /// Copy an alarm's configuration minus its action bindings and id, and
    /// register the copy as a new alarm with a fresh id.
    pub fn clone_alarm(&mut self, id: AlarmId) -> Option<AlarmId> {
        let mut elem = {
            let alarm = self.alarms.get(&id)?;
            let mut elem = Element::new("alarm");
            alarm.write(&mut elem);
            elem
        };
        elem.remove_attr("id");
        if let Some(conditions) = elem.find_mut("conditions") {
            for condition in conditions.children_mut() {
                if let Some(actions) = condition.find_mut("actions") {
                    *actions = Element::new("actions");
                }
            }
        }
        match self.add_alarm(&elem) {
            Ok(new_id) => Some(new_id),
            Err(e) => {
                warn!("[Manager] clone failed: {e}");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Profiles
    // ------------------------------------------------------------------

    pub fn profiles(&self) -> impl Iterator<Item = &EmailProfile> {
        self.profiles.values()
    }

    pub fn create_profile(&mut self) -> String {
        let mut profile = EmailProfile::new();
        profile.name = format!("EmailProfile_{}", profile.unique_id);
        let id = profile.unique_id.clone();
        self.profiles.insert(id.clone(), profile);
        id
    }

    pub fn add_profile(&mut self, profile: EmailProfile) {
        self.profiles.insert(profile.unique_id.clone(), profile);
    }

    pub fn find_profile_id(&self, id: &str) -> Option<&EmailProfile> {
        self.profiles.get(id)
    }

    pub fn find_profile_name(&self, name: &str) -> Option<&EmailProfile> {
        self.profiles.values().find(|p| p.name == name)
    }

    pub fn remove_profile(&mut self, id: &str) {
        self.profiles.remove(id);
    }

    // ------------------------------------------------------------------
    // Configuration document
    // ------------------------------------------------------------------

    /// Read the whole configuration. Loads what it can; errors are
    /// accumulated and returned rather than aborting the read.
    pub fn read(&mut self, root: &Element) -> Vec<String> {
        let mut errors = Vec::new();
        for id in self.alarms.keys().copied().collect::<Vec<_>>() {
            self.sources.remove_requests(id);
            self.remove_actions_for_alarm(id);
        }
        self.alarms.clear();
        self.profiles.clear();
        self.logger = None;
        for child in root.children() {
            match child.name.as_str() {
                "alarm" => {
                    if let Err(e) = self.add_alarm(child) {
                        let name = child.attr("name").unwrap_or("?");
                        errors.push(format!("alarm \"{name}\": {e}"));
                    }
                }
                "EmailProfiles" => {
                    for profile_xml in child.children() {
                        let profile = EmailProfile::read(profile_xml);
                        self.profiles.insert(profile.unique_id.clone(), profile);
                    }
                }
                "log" => {
                    if let Err(e) = self.set_log(child) {
                        errors.push(format!("log configuration: {e}"));
                    }
                }
                _ => {}
            }
        }
        errors
    }

    /// Write the whole configuration to an `alarms` document.
    pub fn write(&self) -> Element {
        let mut root = Element::new("alarms");
        {
            let profiles_xml = root.add_element("EmailProfiles");
            for profile in self.profiles.values() {
                profile.write(profiles_xml.add_element("EmailProfile"));
            }
        }
        for alarm in self.alarms.values() {
            alarm.write(root.add_element("alarm"));
        }
        if self.logger.is_some() {
            let mut log_xml = Element::new("log");
            self.get_log(&mut log_xml);
            root.push_child(log_xml);
        }
        root
    }

    /// Configure the audit log from a `log` element.
    pub fn set_log(&mut self, elem: &Element) -> Result<(), ConfigError> {
        let dir = match &self.alarm_log_dir {
            Some(dir) => dir.clone(),
            None => PathBuf::from(elem.require_attr("directory")?),
        };
        let base_name = elem.require_attr("base-file-name")?.to_string();
        let count = elem.attr_u32("count")?.unwrap_or(4);
        let mut logger = AlarmLogger::new(dir, base_name);
        if let Some(interval) = elem.attr_i64("interval")? {
            logger.set_bale_params(1_048_576, count);
            logger.set_time_based(interval);
        } else if let Some(size) = elem.attr_u32("size")? {
            logger.set_bale_params(u64::from(size), count);
        } else {
            return Err(ConfigError::InvalidLogParams);
        }
        logger.set_enabled(elem.attr_bool("enabled", false)?);
        self.logger = Some(logger);
        if self.was_started {
            self.arm_log_bale_timer();
        }
        Ok(())
    }

    fn get_log(&self, elem: &mut Element) {
        match &self.logger {
            Some(logger) => {
                elem.set_attr("directory", logger.dir().display().to_string());
                elem.set_attr("base-file-name", logger.base_name());
                elem.set_attr("count", logger.bale_count().to_string());
                match logger.time_interval_ms() {
                    Some(interval) => {
                        elem.set_attr("interval", interval.to_string());
                    }
                    None => {
                        elem.set_attr("size", logger.bale_size().to_string());
                    }
                }
                elem.set_attr_bool("enabled", logger.enabled());
            }
            None => {
                elem.set_attr("count", "4");
                elem.set_attr("size", "1048576");
                elem.set_attr_bool("enabled", false);
            }
        }
    }

    pub fn logger(&self) -> Option<&AlarmLogger> {
        self.logger.as_ref()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn start(&mut self) {
        self.was_started = true;
        for id in self.alarms.keys().copied().collect::<Vec<_>>() {
            self.with_alarm(id, |alarm, ctx| alarm.start(ctx));
        }
        self.arm_log_bale_timer();
    }

    pub fn stop(&mut self) {
        if !self.was_started {
            return;
        }
        self.was_started = false;
        for id in self.alarms.keys().copied().collect::<Vec<_>>() {
            self.stop_actions_for_alarm(id);
            self.with_alarm(id, |alarm, ctx| alarm.stop(ctx));
        }
        if let Some(id) = self.log_bale_timer.take() {
            self.timer.disarm(id);
        }
    }

    fn arm_log_bale_timer(&mut self) {
        if let Some(id) = self.log_bale_timer.take() {
            self.timer.disarm(id);
        }
        if let Some(interval) = self.logger.as_ref().and_then(AlarmLogger::time_interval_ms) {
            let delay = u32::try_from(interval.clamp(1_000, i64::from(u32::MAX))).unwrap_or(u32::MAX);
            self.log_bale_timer = Some(self.timer.arm(TimerTarget::LogBale, delay, self.clock.now()));
        }
    }

    // ------------------------------------------------------------------
    // Alarm operations
    // ------------------------------------------------------------------

    pub fn acknowledge(&mut self, id: AlarmId, comments: &str) {
        self.with_alarm(id, |alarm, ctx| alarm.acknowledge(comments, ctx));
    }

    pub fn enable_actions(&mut self, id: AlarmId, enabled: bool) {
        if let Some(alarm) = self.alarms.get_mut(&id) {
            alarm.enable_actions(enabled);
        }
        if !enabled {
            self.stop_actions_for_alarm(id);
        }
    }

    pub fn ignore_next_record(&mut self, id: AlarmId, uri: &str) {
        let Manager {
            alarms, sources, ..
        } = self;
        if let Some(alarm) = alarms.get_mut(&id) {
            alarm.ignore_next_record(uri, sources.as_ref());
        }
    }

    pub fn format_alarm_json(&self, id: AlarmId) -> Option<serde_json::Value> {
        let alarm = self.alarms.get(&id)?;
        Some(alarm.format_json(self.pending_actions_for_alarm(id)))
    }

    // ------------------------------------------------------------------
    // Action queue
    // ------------------------------------------------------------------

    /// Count of queued actions for an alarm, plus one when the in-flight
    /// action belongs to it.
    pub fn pending_actions_for_alarm(&self, id: AlarmId) -> u32 {
        let queued = self.queue.iter().filter(|a| a.alarm == id).count() as u32;
        let current = self
            .current_action
            .as_ref()
            .is_some_and(|a| a.alarm == id) as u32;
        queued + current
    }

    pub fn total_pending_actions(&self) -> u32 {
        self.queue.len() as u32 + self.current_action.is_some() as u32
    }

    /// Drop queued actions for an alarm. An in-flight action is orphaned:
    /// its completion event finds no owner and is dropped.
    pub fn stop_actions_for_alarm(&mut self, id: AlarmId) {
        self.queue.retain(|a| a.alarm != id);
        if self
            .current_action
            .as_ref()
            .is_some_and(|a| a.alarm == id)
        {
            self.current_action = None;
        }
    }

    pub fn remove_actions_for_alarm(&mut self, id: AlarmId) {
        self.stop_actions_for_alarm(id);
    }

    fn begin_next_action(&mut self) {
        if self.current_action.is_some() {
            return;
        }
        let Some(instance) = self.queue.pop_front() else {
            return;
        };
        let action_id = instance.id;
        match &instance.payload {
            ActionPayload::Email {
                profile,
                subject,
                message,
                attachment,
            } => match self.profiles.get(profile) {
                Some(p) if !p.to_address.trim().is_empty() => {
                    let request = EmailRequest {
                        profile: p.clone(),
                        subject: subject.clone(),
                        message: message.clone(),
                        attachments: attachment.iter().cloned().collect(),
                    };
                    self.current_action = Some(instance);
                    self.email.send(action_id, request, self.events_tx.clone());
                }
                _ => {
                    self.current_action = Some(instance);
                    let _ = self.events_tx.send(EngineEvent::ActionComplete {
                        action: action_id,
                        error: Some("no destination address".to_string()),
                    });
                }
            },
            ActionPayload::Forward { uri, value } => {
                let sink = instance.alarm;
                let uri = uri.clone();
                let value = value.clone();
                self.current_action = Some(instance);
                if !self.sources.start_set_value(sink, &uri, value) {
                    let _ = self.events_tx.send(EngineEvent::ActionComplete {
                        action: action_id,
                        error: Some("invalid destination URI".to_string()),
                    });
                }
            }
            ActionPayload::Exec { command } => {
                let command = command.clone();
                self.current_action = Some(instance);
                self.exec.launch(action_id, command, self.events_tx.clone());
            }
        }
    }

    fn on_action_complete(&mut self, action_id: u64, error: Option<String>) {
        let was_current = self
            .current_action
            .as_ref()
            .is_some_and(|a| a.id == action_id);
        let mut instance = if was_current {
            match self.current_action.take() {
                Some(instance) => instance,
                None => return,
            }
        } else {
            // an orphaned completion (its alarm was stopped): drop it
            match self.queue.iter().position(|a| a.id == action_id) {
                Some(pos) => match self.queue.remove(pos) {
                    Some(instance) => instance,
                    None => return,
                },
                None => return,
            }
        };
        instance.complete = true;
        instance.last_error = error.unwrap_or_default();

        let mut log = Element::new("action-complete");
        log.set_attr("name", &instance.alarm_name);
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
                    self.profiles.get(profile).map(|p| p.name.clone())
                }
                _ => None,
            };
            instance.describe_log(action_xml, profile_name.as_deref());
        }
        self.add_log(log);

        if let Some(alarm) = self.alarms.get_mut(&instance.alarm) {
            alarm.record_action_error(&instance.last_error);
        }
        self.client.on_alarm_change(instance.alarm);
        if was_current {
            self.begin_next_action();
        }
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    pub fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Source(SourceEvent::SinkReady {
                sink,
                uri: _,
                is_table,
            }) => {
                self.with_alarm(sink, |alarm, ctx| alarm.on_sink_ready(is_table, ctx));
            }
            EngineEvent::Source(SourceEvent::SinkFailure { sink, uri, failure }) => {
                self.with_alarm(sink, |alarm, ctx| {
                    alarm.on_sink_failure(&uri, &failure, ctx)
                });
            }
            EngineEvent::Source(SourceEvent::Records { sink, records }) => {
                self.with_alarm(sink, |alarm, ctx| alarm.on_records(&records, ctx));
            }
            EngineEvent::Source(SourceEvent::SetComplete { sink, uri, outcome }) => {
                self.on_set_complete(sink, &uri, outcome);
            }
            EngineEvent::ActionComplete { action, error } => {
                self.on_action_complete(action, error);
                self.flush_effects();
            }
        }
    }

    fn on_set_complete(&mut self, sink: AlarmId, uri: &str, outcome: SetOutcome) {
        let is_current_forward = self.current_action.as_ref().is_some_and(|a| {
            a.alarm == sink && matches!(a.payload, ActionPayload::Forward { .. })
        });
        if !is_current_forward {
            return;
        }
        let error = match outcome {
            SetOutcome::Succeeded => {
                // The server will report the table again after the write;
                // suppress that echo so the alarm does not re-trigger.
                let Manager {
                    alarms, sources, ..
                } = self;
                if let Some(alarm) = alarms.get_mut(&sink) {
                    alarm.ignore_next_record(uri, sources.as_ref());
                }
                None
            }
            other => Some(other.to_string()),
        };
        let action_id = self
            .current_action
            .as_ref()
            .map(|a| a.id)
            .unwrap_or_default();
        self.on_action_complete(action_id, error);
        self.flush_effects();
    }

    /// Route a fired one-shot timer.
    pub fn on_timer_fired(&mut self, id: TimerId, target: TimerTarget) {
        match target {
            TimerTarget::NoData { alarm, condition } => {
                self.with_alarm(alarm, |alarm, ctx| {
                    alarm.on_nodata_timer(condition, id, ctx)
                });
            }
            TimerTarget::ActionDelay {
                alarm,
                condition,
                template,
            } => {
                self.with_alarm(alarm, |alarm, ctx| {
                    alarm.on_action_timer(condition, template, ctx)
                });
            }
            TimerTarget::LogBale => {
                if let Some(logger) = &mut self.logger {
                    if let Err(e) = logger.bale_now() {
                        warn!("[Manager] log bale failed: {e}");
                    }
                }
                self.log_bale_timer = None;
                self.arm_log_bale_timer();
            }
        }
    }

    /// Fire every expired timer against the injected clock.
    pub fn poll_timers(&mut self) {
        let now = self.clock.now();
        for (id, target) in self.timer.poll(now) {
            self.on_timer_fired(id, target);
        }
    }

    pub fn next_timer_deadline(&self) -> Option<DateTime<Utc>> {
        self.timer.next_deadline()
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    /// Stamp an event with the current time and hand it to the logger and
    /// the client.
    pub fn add_log(&mut self, mut elem: Element) {
        elem.set_attr(
            "date",
            self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        self.client.on_log_event(&elem);
        if let Some(logger) = &mut self.logger {
            logger.write_event(&elem);
        }
    }

    // ------------------------------------------------------------------
    // Internal plumbing
    // ------------------------------------------------------------------

    /// Run one alarm operation with a borrowed engine context, then flush
    /// the log/action outboxes it filled.
    fn with_alarm<F>(&mut self, id: AlarmId, op: F)
    where
        F: FnOnce(&mut Alarm, &mut Ctx),
    {
        let Manager {
            clock,
            timer,
            sources,
            client,
            profiles,
            alarms,
            pending_logs,
            pending_actions,
            next_action_id,
            exec_actions_allowed,
            ..
        } = self;
        if let Some(alarm) = alarms.get_mut(&id) {
            let mut ctx = Ctx {
                clock: clock.as_ref(),
                timer,
                sources: sources.as_mut(),
                client: client.as_mut(),
                logs: pending_logs,
                actions: pending_actions,
                next_action_id,
                exec_allowed: *exec_actions_allowed,
                profiles,
            };
            op(alarm, &mut ctx);
        }
        self.flush_effects();
    }

    fn flush_effects(&mut self) {
        let logs: Vec<Element> = self.pending_logs.drain(..).collect();
        for log in logs {
            self.add_log(log);
        }
        let actions: Vec<ActionInstance> = self.pending_actions.drain(..).collect();
        for action in actions {
            self.queue.push_back(action);
        }
        if self.current_action.is_none() {
            self.begin_next_action();
        }
    }
}
