//! Shared harness for the engine integration tests: a manual clock, an
//! in-memory source double, a recording client, and a scripted email
//! transport, all wired into one manager.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use vigil::alarm::manager::{EmailRequest, EmailTransport, EventReceiver, EventSender};
use vigil::{
    AlarmClient, AlarmId, Clock, DataSources, Element, EngineEvent, ManualClock, Manager, Operand,
    Record, Request, SimSources, SourceEvent, Value,
};

/// Client that records every log event and state-change notification.
#[derive(Default)]
pub struct RecordingClient {
    pub events: Arc<Mutex<Vec<Element>>>,
    pub changes: Arc<Mutex<Vec<AlarmId>>>,
}

impl AlarmClient for RecordingClient {
    fn on_alarm_change(&mut self, alarm: AlarmId) {
        if let Ok(mut changes) = self.changes.lock() {
            changes.push(alarm);
        }
    }

    fn on_log_event(&mut self, event: &Element) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Email transport that records requests and completes with scripted
/// outcomes (`None` = success).
pub struct ScriptedEmail {
    pub sent: Arc<Mutex<Vec<EmailRequest>>>,
    pub outcomes: Arc<Mutex<VecDeque<Option<String>>>>,
}

impl EmailTransport for ScriptedEmail {
    fn send(&mut self, action: u64, request: EmailRequest, done: EventSender) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(request);
        }
        let error = self
            .outcomes
            .lock()
            .ok()
            .and_then(|mut o| o.pop_front())
            .unwrap_or(None);
        let _ = done.send(EngineEvent::ActionComplete { action, error });
    }
}

/// `DataSources` facade over a shared `SimSources` the test can inspect.
pub struct SharedSources(pub Arc<Mutex<SimSources>>);

impl DataSources for SharedSources {
    fn add_request(&mut self, sink: AlarmId, request: Request) {
        if let Ok(mut inner) = self.0.lock() {
            inner.add_request(sink, request);
        }
    }

    fn remove_requests(&mut self, sink: AlarmId) {
        if let Ok(mut inner) = self.0.lock() {
            inner.remove_requests(sink);
        }
    }

    fn activate_requests(&mut self) {
        if let Ok(mut inner) = self.0.lock() {
            inner.activate_requests();
        }
    }

    fn start_set_value(&mut self, sink: AlarmId, uri: &str, value: Value) -> bool {
        self.0
            .lock()
            .map(|mut inner| inner.start_set_value(sink, uri, value))
            .unwrap_or(false)
    }
}

pub struct Harness {
    pub clock: ManualClock,
    pub manager: Manager,
    pub rx: EventReceiver,
    pub events: Arc<Mutex<Vec<Element>>>,
    pub changes: Arc<Mutex<Vec<AlarmId>>>,
    pub sent: Arc<Mutex<Vec<EmailRequest>>>,
    pub outcomes: Arc<Mutex<VecDeque<Option<String>>>>,
    pub sources: Arc<Mutex<SimSources>>,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
}

impl Harness {
    pub fn new() -> Self {
        let clock = ManualClock::new(start_time());
        let (tx, rx) = vigil::engine::event_channel();
        let sources = Arc::new(Mutex::new(SimSources::new()));
        let mut manager = Manager::new(
            Arc::new(clock.clone()),
            Box::new(SharedSources(sources.clone())),
            tx,
        );
        let events = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(Mutex::new(Vec::new()));
        manager.set_client(Box::new(RecordingClient {
            events: events.clone(),
            changes: changes.clone(),
        }));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let outcomes = Arc::new(Mutex::new(VecDeque::new()));
        manager.set_email_transport(Box::new(ScriptedEmail {
            sent: sent.clone(),
            outcomes: outcomes.clone(),
        }));
        Self {
            clock,
            manager,
            rx,
            events,
            changes,
            sent,
            outcomes,
            sources,
        }
    }

    /// Load a configuration document; panics on any read error.
    pub fn load(&mut self, config: &str) -> AlarmId {
        let root = Element::parse(config).expect("config parses");
        let errors = self.manager.read(&root);
        assert!(errors.is_empty(), "config errors: {errors:?}");
        let alarm = self
            .manager
            .alarms()
            .next()
            .expect("at least one alarm loaded");
        alarm.sink()
    }

    pub fn start(&mut self, sink: AlarmId, is_table: bool) {
        self.manager.start();
        self.manager
            .dispatch(EngineEvent::Source(SourceEvent::SinkReady {
                sink,
                uri: String::new(),
                is_table,
            }));
        self.pump();
    }

    /// Drain and dispatch every queued engine event.
    pub fn pump(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.manager.dispatch(event);
        }
    }

    /// Deliver one single-field record to the alarm.
    pub fn feed(&mut self, sink: AlarmId, table: &str, field: &str, value: f64) {
        let record = Record::new(table, self.clock.now()).with_field(field, Value::Double(value));
        self.manager
            .dispatch(EngineEvent::Source(SourceEvent::Records {
                sink,
                records: vec![record],
            }));
        self.pump();
    }

    /// Advance the manual clock and fire any expired timers.
    pub fn advance(&mut self, ms: i64) {
        self.clock.advance_ms(ms);
        self.manager.poll_timers();
        self.pump();
    }

    /// Names of every log event seen so far, in order.
    pub fn event_kinds(&self) -> Vec<String> {
        self.events
            .lock()
            .map(|events| events.iter().map(|e| e.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn events_of_kind(&self, kind: &str) -> Vec<Element> {
        self.events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.name == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn last_value_of(&self, sink: AlarmId) -> Option<Operand> {
        self.manager.alarm(sink).and_then(|a| a.last_value().cloned())
    }

    /// The spec's cross-cutting invariants, checked after interesting steps.
    pub fn check_invariants(&self, sink: AlarmId) {
        let alarm = self.manager.alarm(sink).expect("alarm exists");
        if alarm.state() == vigil::AlarmState::Off {
            // triggered_condition == null implies acknowledged == false
            assert_eq!(alarm.triggered_condition_name(), "");
        }
        // every alarm-off is preceded by a matching alarm-triggered
        let kinds = self.event_kinds();
        let mut depth = 0i64;
        for kind in &kinds {
            match kind.as_str() {
                "alarm-triggered" => depth += 1,
                "alarm-off" => {
                    depth -= 1;
                    assert!(depth >= 0, "alarm-off without a preceding alarm-triggered");
                }
                _ => {}
            }
        }
    }
}

/// One-alarm config: data condition with an email action.
pub fn threshold_email_config(
    latched: bool,
    initial_delay: u32,
    interval: u32,
) -> String {
    format!(
        r#"<alarms>
  <EmailProfiles>
    <EmailProfile unique-id="p-1" name="station ops" use-gateway="false">
      <smtp-server>mail.example.com:587</smtp-server>
      <smtp-user-name>ops</smtp-user-name>
      <smtp-password>pw</smtp-password>
      <from-address>logger@example.com</from-address>
      <to-address>oncall@example.com</to-address>
      <cc-address></cc-address>
      <bcc-address></bcc-address>
    </EmailProfile>
  </EmailProfiles>
  <alarm name="Over Temp" latched="{latched}">
    <source>station.public.Temp</source>
    <conditions>
      <condition name="high">
        <test type="data">
          <on-expr>Temp &gt; 100</on-expr>
        </test>
        <actions>
          <action type="email" profile="p-1" initial-delay="{initial_delay}" interval="{interval}">
            <subject>%n triggered</subject>
            <body>value %v at %t (%c)</body>
          </action>
        </actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#
    )
}
