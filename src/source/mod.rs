//! Data-source boundary: subscription requests, records, and the producer
//! interface the engine talks to.
//!
//! Concrete sources (server RPC, files, replay) live outside this crate. The
//! engine only needs to open subscriptions, push set-value writes, and
//! receive completions back as [`SourceEvent`]s on its event loop.

use chrono::{DateTime, Duration, Utc};

use crate::value::{Operand, Value};

/// Where a subscription begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOption {
    AtRecord(u64),
    AtTime(DateTime<Utc>),
    DateRange(DateTime<Utc>, DateTime<Utc>),
    RelativeToNewest(i64),
    AtOffsetFromNewest(u32),
    AtNewest,
}

/// How records are ordered and gap-filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderOption {
    LoggedWithHoles,
    LoggedWithoutHoles,
    RealTime,
    Collected,
}

/// Parameters for subscribing to one source column.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub uri: String,
    pub start: StartOption,
    pub order: OrderOption,
    pub backfill: Option<Duration>,
    pub report_offset: i64,
}

impl Request {
    pub fn new(uri: impl Into<String>, defaults: &RequestDefaults) -> Self {
        Self {
            uri: uri.into(),
            start: defaults.start.clone(),
            order: defaults.order,
            backfill: None,
            report_offset: 0,
        }
    }

    /// Compatible requests share one underlying subscription.
    pub fn is_compatible(&self, other: &Request) -> bool {
        self.uri == other.uri
            && self.start == other.start
            && self.order == other.order
            && self.report_offset == other.report_offset
    }

    /// URI of the table this request's column belongs to.
    pub fn table_uri(&self) -> String {
        table_uri_of(&self.uri)
    }

    /// Column name addressed by this request's URI.
    pub fn column_name(&self) -> &str {
        column_name_of(&self.uri)
    }
}

/// Start/order options applied to requests an expression generates.
///
/// Alarm source expressions subscribe logged-without-holes starting at the
/// newest record, matching the original engine's hardwired default.
#[derive(Debug, Clone)]
pub struct RequestDefaults {
    pub start: StartOption,
    pub order: OrderOption,
}

impl Default for RequestDefaults {
    fn default() -> Self {
        Self {
            start: StartOption::AtNewest,
            order: OrderOption::LoggedWithoutHoles,
        }
    }
}

/// Strip the final (column) component of a `station.table.column` URI.
/// A URI with fewer than three components already names a table.
pub fn table_uri_of(uri: &str) -> String {
    let parts: Vec<&str> = uri.split('.').collect();
    if parts.len() >= 3 {
        parts[..parts.len() - 1].join(".")
    } else {
        uri.to_string()
    }
}

/// Final component of a column URI.
pub fn column_name_of(uri: &str) -> &str {
    uri.rsplit('.').next().unwrap_or(uri)
}

/// One delivered record: the table it came from, its stamp, and named fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub table_uri: String,
    pub stamp: DateTime<Utc>,
    pub fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(table_uri: impl Into<String>, stamp: DateTime<Utc>) -> Self {
        Self {
            table_uri: table_uri.into(),
            stamp,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn field_operand(&self, name: &str) -> Option<Operand> {
        self.field(name)
            .map(|v| Operand::new(v.clone(), self.stamp))
    }
}

/// Identifies the sink (alarm) a completion is routed back to.
pub type SinkId = u64;

/// Why a subscription failed. Requests stay registered so recovery is
/// automatic when the source comes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkFailure {
    InvalidUri,
    ConnectionLost,
    TableUnavailable,
    Unsupported,
    Other(String),
}

impl std::fmt::Display for SinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkFailure::InvalidUri => write!(f, "invalid uri"),
            SinkFailure::ConnectionLost => write!(f, "connection lost"),
            SinkFailure::TableUnavailable => write!(f, "table unavailable"),
            SinkFailure::Unsupported => write!(f, "request not supported"),
            SinkFailure::Other(detail) => write!(f, "{detail}"),
        }
    }
}

/// Outcome of a `start_set_value` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Succeeded,
    InvalidUri,
    AccessDenied,
    CommunicationFailed,
    Other(String),
}

impl std::fmt::Display for SetOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetOutcome::Succeeded => write!(f, "succeeded"),
            SetOutcome::InvalidUri => write!(f, "invalid destination URI"),
            SetOutcome::AccessDenied => write!(f, "access denied"),
            SetOutcome::CommunicationFailed => write!(f, "communication failed"),
            SetOutcome::Other(detail) => write!(f, "{detail}"),
        }
    }
}

/// Completions the source layer posts back to the engine loop.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A request has been accepted and is live. `is_table` reports whether
    /// the URI addresses a whole table rather than a single column.
    SinkReady {
        sink: SinkId,
        uri: String,
        is_table: bool,
    },
    SinkFailure {
        sink: SinkId,
        uri: String,
        failure: SinkFailure,
    },
    /// A batch of records for one table subscription.
    Records { sink: SinkId, records: Vec<Record> },
    SetComplete {
        sink: SinkId,
        uri: String,
        outcome: SetOutcome,
    },
}

/// Producer interface the engine drives. Implementations deliver completions
/// as [`SourceEvent`]s through the engine's event channel.
pub trait DataSources: Send {
    /// Register a subscription for the given sink. Compatible requests may
    /// be coalesced onto one underlying subscription.
    fn add_request(&mut self, sink: SinkId, request: Request);

    /// Drop every request registered by the given sink.
    fn remove_requests(&mut self, sink: SinkId);

    /// Activate requests registered since the last activation.
    fn activate_requests(&mut self);

    /// Begin an asynchronous value write. Returns false when the URI cannot
    /// be routed at all (no `SetComplete` will follow).
    fn start_set_value(&mut self, sink: SinkId, uri: &str, value: Value) -> bool;

    /// Normalize a column or table URI to its table form.
    fn make_table_uri(&self, uri: &str) -> String {
        table_uri_of(uri)
    }
}

/// In-memory source double for tests and replay harnesses: records the
/// requests and writes the engine makes, and lets the harness inject
/// completions by hand.
#[derive(Debug, Default)]
pub struct SimSources {
    pub requests: Vec<(SinkId, Request)>,
    pub activations: usize,
    pub set_values: Vec<(SinkId, String, Value)>,
    /// When false, `start_set_value` reports an unroutable URI.
    pub accept_writes: bool,
}

impl SimSources {
    pub fn new() -> Self {
        Self {
            accept_writes: true,
            ..Default::default()
        }
    }

    pub fn requests_for(&self, sink: SinkId) -> impl Iterator<Item = &Request> {
        self.requests
            .iter()
            .filter(move |(s, _)| *s == sink)
            .map(|(_, r)| r)
    }
}

impl DataSources for SimSources {
    fn add_request(&mut self, sink: SinkId, request: Request) {
        self.requests.push((sink, request));
    }

    fn remove_requests(&mut self, sink: SinkId) {
        self.requests.retain(|(s, _)| *s != sink);
    }

    fn activate_requests(&mut self) {
        self.activations += 1;
    }

    fn start_set_value(&mut self, sink: SinkId, uri: &str, value: Value) -> bool {
        if !self.accept_writes {
            return false;
        }
        self.set_values.push((sink, uri.to_string(), value));
        true
    }
}
