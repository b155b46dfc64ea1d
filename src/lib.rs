//! Vigil: an event-driven alarms engine for live datalogger streams.
//!
//! The engine watches data-source records, evaluates user-authored
//! expressions, walks each alarm through a trigger/acknowledge state
//! machine, executes rate-limited side-effecting actions (email, value
//! forwarding, external processes), and persists a rolling baled XML audit
//! log.
//!
//! ## Architecture
//!
//! - **Expression engine**: postfix evaluation with stateful running
//!   aggregates and historic lookups ([`expr`])
//! - **Alarms**: conditions, data/no-data tests, latching and
//!   acknowledgement ([`alarm`])
//! - **Actions**: serialized manager queue with per-template delay and
//!   repeat throttling ([`alarm::actions`])
//! - **SMTP**: one-shot protocol state machine with STARTTLS and an HTTP
//!   gateway fallback ([`smtp`])
//! - **Audit log**: crash-safe baled XML envelope ([`alarm::logger`])

pub mod alarm;
pub mod clock;
pub mod engine;
pub mod error;
pub mod expr;
pub mod smtp;
pub mod source;
pub mod value;
pub mod xml;

// Re-export the types most integrations touch.
pub use alarm::manager::{
    EmailRequest, EmailTransport, EngineEvent, EventReceiver, EventSender, Manager,
    ProcessLauncher,
};
pub use alarm::{Alarm, AlarmClient, AlarmId, AlarmState, NullClient};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ConfigError, EvalError, ParseError};
pub use expr::{Expression, TokenFactory};
pub use source::{
    DataSources, OrderOption, Record, Request, RequestDefaults, SimSources, SinkFailure,
    SourceEvent, StartOption,
};
pub use value::{Operand, Value};
pub use xml::Element;
