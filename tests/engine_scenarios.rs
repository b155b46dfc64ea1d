//! End-to-end scenarios for the alarms engine: trigger/off cycles, action
//! throttling, acknowledgement under latching, the no-data watchdog, and
//! forward write-back suppression. Everything runs against a manual clock
//! and in-memory doubles; no sockets, no real timers.

mod common;

use common::{threshold_email_config, Harness};
use vigil::{AlarmState, EngineEvent, SourceEvent, Value};

#[test]
fn simple_threshold_fires_email_once() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 0, 0));
    h.start(sink, false);

    for temp in [99.0, 101.0, 102.0, 99.0] {
        h.feed(sink, "station.public", "Temp", temp);
        h.check_invariants(sink);
    }

    assert_eq!(
        h.event_kinds(),
        vec![
            "alarm-triggered",
            "action-started",
            "action-complete",
            "alarm-off"
        ]
    );
    assert_eq!(h.sent_count(), 1);
    let sent = h.sent.lock().unwrap();
    assert_eq!(sent[0].subject, "Over Temp triggered");
    assert!(sent[0].message.starts_with("value 101"));
    assert_eq!(sent[0].profile.to_address, "oncall@example.com");
}

#[test]
fn periodic_repeat_until_acknowledged() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(true, 0, 5000));
    h.start(sink, false);

    h.feed(sink, "station.public", "Temp", 101.0);
    assert_eq!(h.sent_count(), 1); // immediate firing at t=0

    h.advance(5000);
    assert_eq!(h.sent_count(), 2); // t=5000

    h.advance(5000);
    assert_eq!(h.sent_count(), 3); // t=10000

    h.advance(1000); // t=11000
    h.manager.acknowledge(sink, "on it");
    h.pump();
    assert_eq!(
        h.manager.alarm(sink).unwrap().state(),
        AlarmState::Acknowledged
    );
    assert_eq!(h.events_of_kind("alarm-acknowledged").len(), 1);

    // no further firings after the ack
    h.advance(15000);
    assert_eq!(h.sent_count(), 3);

    // latched + acked: an off-condition does not clear the alarm
    h.feed(sink, "station.public", "Temp", 99.0);
    assert!(h.events_of_kind("alarm-off").is_empty());
    assert_eq!(
        h.manager.alarm(sink).unwrap().state(),
        AlarmState::Acknowledged
    );
    h.check_invariants(sink);
}

#[test]
fn acknowledge_is_idempotent() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(true, 0, 0));
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);

    h.manager.acknowledge(sink, "first");
    h.pump();
    h.manager.acknowledge(sink, "second");
    h.pump();
    assert_eq!(h.events_of_kind("alarm-acknowledged").len(), 1);
}

#[test]
fn acknowledge_on_off_alarm_is_a_noop() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 0, 0));
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 99.0);

    h.manager.acknowledge(sink, "nothing to ack");
    h.pump();
    assert!(h.events_of_kind("alarm-acknowledged").is_empty());
    assert_eq!(h.manager.alarm(sink).unwrap().state(), AlarmState::Off);
}

#[test]
fn acknowledge_on_latched_alarm_with_cleared_test_goes_off() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(true, 0, 0));
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);
    // condition clears but the latch holds the triggered state
    h.feed(sink, "station.public", "Temp", 99.0);
    assert_eq!(h.manager.alarm(sink).unwrap().state(), AlarmState::On);
    assert!(h.events_of_kind("alarm-off").is_empty());

    h.manager.acknowledge(sink, "clearing");
    h.pump();
    assert_eq!(h.manager.alarm(sink).unwrap().state(), AlarmState::Off);
    assert_eq!(h.events_of_kind("alarm-off").len(), 1);
    h.check_invariants(sink);
}

#[test]
fn initial_delay_defers_the_first_firing() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 2000, 0));
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);
    assert_eq!(h.sent_count(), 0);

    h.advance(1999);
    assert_eq!(h.sent_count(), 0);
    h.advance(1);
    assert_eq!(h.sent_count(), 1);
}

#[test]
fn alarm_off_cancels_a_pending_delay() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 2000, 0));
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);
    // value drops before the delay elapses: the armed action is cancelled
    h.feed(sink, "station.public", "Temp", 99.0);
    h.advance(5000);
    assert_eq!(h.sent_count(), 0);
    assert_eq!(h.event_kinds(), vec!["alarm-triggered", "alarm-off"]);
}

#[test]
fn no_data_watchdog_fires_and_clears() {
    let config = r#"<alarms>
  <alarm name="Silent Station" latched="false">
    <source>station.public.Temp</source>
    <conditions>
      <condition name="watchdog">
        <test type="no-data" interval="2000"/>
        <actions></actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#;
    let mut h = Harness::new();
    let sink = h.load(config);
    h.start(sink, false);

    h.advance(500);
    h.feed(sink, "station.public", "Temp", 20.0);
    h.advance(1000); // t=1500
    h.feed(sink, "station.public", "Temp", 21.0);

    // silence from t=1500; the watchdog fires at t=3500 <= 4000
    h.advance(2500);
    let triggered = h.events_of_kind("alarm-triggered");
    assert_eq!(triggered.len(), 1);
    let entrance = triggered[0]
        .find("condition")
        .and_then(|c| c.find("entrance"))
        .map(|e| e.text().to_string())
        .unwrap_or_default();
    assert_eq!(entrance, "no data received");

    // fresh data clears the alarm
    h.advance(1000); // t=5000
    h.feed(sink, "station.public", "Temp", 22.0);
    let off = h.events_of_kind("alarm-off");
    assert_eq!(off.len(), 1);
    let exit = off[0]
        .find("condition")
        .and_then(|c| c.find("exit"))
        .map(|e| e.text().to_string())
        .unwrap_or_default();
    assert_eq!(exit, "data received");
    h.check_invariants(sink);
}

#[test]
fn watchdog_fires_once_per_silence_not_per_record() {
    let config = r#"<alarms>
  <alarm name="Silent" latched="false">
    <source>station.public.Temp</source>
    <conditions>
      <condition name="watchdog">
        <test type="no-data" interval="1000"/>
        <actions></actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#;
    let mut h = Harness::new();
    let sink = h.load(config);
    h.start(sink, false);
    h.advance(5000);
    // a single firing for the whole silent stretch
    assert_eq!(h.events_of_kind("alarm-triggered").len(), 1);
}

#[test]
fn forward_action_suppresses_its_own_echo() {
    let config = r#"<alarms>
  <alarm name="Clamp" latched="false">
    <source>station.public.X</source>
    <conditions>
      <condition name="negative">
        <test type="data">
          <on-expr>X &lt; 0</on-expr>
          <off-expr>1</off-expr>
        </test>
        <actions>
          <action type="forward">
            <forward-expression>0</forward-expression>
            <dest-uri>station.public.X</dest-uri>
          </action>
        </actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#;
    let mut h = Harness::new();
    let sink = h.load(config);
    h.start(sink, false);

    h.feed(sink, "station.public", "X", -1.0);
    // the const off-expression clears the alarm within the same batch
    assert_eq!(h.event_kinds()[..2], ["alarm-triggered", "action-started"]);
    assert!(h.event_kinds().contains(&"alarm-off".to_string()));

    // the write-back went to the source layer
    {
        let sources = h.sources.lock().unwrap();
        assert_eq!(sources.set_values.len(), 1);
        assert_eq!(sources.set_values[0].1, "station.public.X");
        assert_eq!(sources.set_values[0].2, Value::Int(0));
    }

    // the source layer confirms; the engine arms the echo suppression
    h.manager
        .dispatch(EngineEvent::Source(SourceEvent::SetComplete {
            sink,
            uri: "station.public.X".to_string(),
            outcome: vigil::source::SetOutcome::Succeeded,
        }));
    h.pump();
    assert_eq!(h.events_of_kind("action-complete").len(), 1);

    // the echo of our own write is ignored: no second trigger cycle
    let triggers_before = h.events_of_kind("alarm-triggered").len();
    h.feed(sink, "station.public", "X", 0.0);
    assert_eq!(h.events_of_kind("alarm-triggered").len(), triggers_before);

    // a genuine new excursion still triggers
    h.feed(sink, "station.public", "X", -2.0);
    assert_eq!(
        h.events_of_kind("alarm-triggered").len(),
        triggers_before + 1
    );
    h.check_invariants(sink);
}

#[test]
fn failed_email_surfaces_error_and_queue_progresses() {
    // two email actions on the same condition; the first send fails
    let config = r#"<alarms>
  <EmailProfiles>
    <EmailProfile unique-id="p-1" name="ops" use-gateway="false">
      <smtp-server>mail.example.com</smtp-server>
      <smtp-user-name>ops</smtp-user-name>
      <smtp-password>pw</smtp-password>
      <from-address>logger@example.com</from-address>
      <to-address>oncall@example.com</to-address>
      <cc-address></cc-address>
      <bcc-address></bcc-address>
    </EmailProfile>
  </EmailProfiles>
  <alarm name="Over Temp" latched="false">
    <source>station.public.Temp</source>
    <conditions>
      <condition name="high">
        <test type="data">
          <on-expr>Temp &gt; 100</on-expr>
        </test>
        <actions>
          <action type="email" profile="p-1">
            <subject>first</subject>
            <body>first</body>
          </action>
          <action type="email" profile="p-1">
            <subject>second</subject>
            <body>second</body>
          </action>
        </actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#;
    let mut h = Harness::new();
    let sink = h.load(config);
    h.outcomes
        .lock()
        .unwrap()
        .push_back(Some("the server rejected the client greeting".to_string()));
    h.start(sink, false);

    h.feed(sink, "station.public", "Temp", 101.0);
    // both actions ran, one at a time, in order
    assert_eq!(h.sent_count(), 2);
    let completes = h.events_of_kind("action-complete");
    assert_eq!(completes.len(), 2);
    let outcome_of = |e: &vigil::Element| {
        e.find("action")
            .and_then(|a| a.find("outcome"))
            .map(|o| o.text().to_string())
            .unwrap_or_default()
    };
    assert_eq!(
        outcome_of(&completes[0]),
        "failure: the server rejected the client greeting"
    );
    assert_eq!(outcome_of(&completes[1]), "success");
    // the alarm carries the most recent action result
    assert_eq!(h.manager.alarm(sink).unwrap().last_action_error(), "");
    assert_eq!(h.manager.pending_actions_for_alarm(sink), 0);
}

#[test]
fn missing_profile_fails_cleanly() {
    let config = r#"<alarms>
  <alarm name="Over Temp" latched="false">
    <source>station.public.Temp</source>
    <conditions>
      <condition name="high">
        <test type="data">
          <on-expr>Temp &gt; 100</on-expr>
        </test>
        <actions>
          <action type="email" profile="missing">
            <subject>s</subject>
            <body>b</body>
          </action>
        </actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#;
    let mut h = Harness::new();
    let sink = h.load(config);
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);

    assert_eq!(h.sent_count(), 0);
    assert_eq!(
        h.manager.alarm(sink).unwrap().last_action_error(),
        "no destination address"
    );
}

#[test]
fn ignore_next_record_skips_exactly_n_records() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 0, 0));
    h.start(sink, false);

    h.manager.ignore_next_record(sink, "station.public.Temp");
    h.manager.ignore_next_record(sink, "station.public.Temp");

    h.feed(sink, "station.public", "Temp", 101.0);
    h.feed(sink, "station.public", "Temp", 102.0);
    // both suppressed: no value, no trigger
    assert!(h.last_value_of(sink).is_none());
    assert!(h.events_of_kind("alarm-triggered").is_empty());

    h.feed(sink, "station.public", "Temp", 103.0);
    assert_eq!(
        h.last_value_of(sink).map(|v| v.value),
        Some(Value::Double(103.0))
    );
    assert_eq!(h.events_of_kind("alarm-triggered").len(), 1);
}

#[test]
fn stop_twice_is_a_noop() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 0, 0));
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);

    h.manager.stop();
    let kinds_after_first = h.event_kinds();
    h.manager.stop();
    assert_eq!(h.event_kinds(), kinds_after_first);
    assert_eq!(h.manager.alarm(sink).unwrap().state(), AlarmState::Off);
    assert_eq!(h.manager.pending_actions_for_alarm(sink), 0);
}

#[test]
fn pending_action_accounting_matches_queue() {
    // delay both actions so they stay queued while we count
    let config = r#"<alarms>
  <EmailProfiles>
    <EmailProfile unique-id="p-1" name="ops" use-gateway="false">
      <smtp-server>mail.example.com</smtp-server>
      <smtp-user-name>u</smtp-user-name>
      <smtp-password>p</smtp-password>
      <from-address>f@x.com</from-address>
      <to-address>t@x.com</to-address>
      <cc-address></cc-address>
      <bcc-address></bcc-address>
    </EmailProfile>
  </EmailProfiles>
  <alarm name="A" latched="false">
    <source>station.public.Temp</source>
    <conditions>
      <condition name="c">
        <test type="data">
          <on-expr>Temp &gt; 100</on-expr>
        </test>
        <actions>
          <action type="email" profile="p-1">
            <subject>s</subject>
            <body>b</body>
          </action>
        </actions>
      </condition>
    </conditions>
  </alarm>
</alarms>"#;
    let mut h = Harness::new();
    let sink = h.load(config);
    h.start(sink, false);
    h.feed(sink, "station.public", "Temp", 101.0);
    // the scripted transport completed everything already
    assert_eq!(h.manager.pending_actions_for_alarm(sink), 0);
    assert_eq!(h.manager.total_pending_actions(), 0);
    assert_eq!(h.sent_count(), 1);
}

#[test]
fn enable_actions_false_suppresses_new_firings() {
    let mut h = Harness::new();
    let sink = h.load(&threshold_email_config(false, 0, 0));
    h.start(sink, false);
    h.manager.enable_actions(sink, false);

    h.feed(sink, "station.public", "Temp", 101.0);
    assert_eq!(h.sent_count(), 0);
    assert!(h.events_of_kind("action-started").is_empty());
    // the alarm itself still triggers
    assert_eq!(h.events_of_kind("alarm-triggered").len(), 1);
}
