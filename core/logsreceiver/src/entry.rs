//! Log entries, the values that flow through a pipeline.

use std::{
    collections::BTreeMap,
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

/// String key-values attached to an [`Entry`].
pub type Attributes = BTreeMap<String, String>;

/// One observed log event.
///
/// An entry is created by an input operator, modified in place by the intermediate
/// operators of the chain, and finally copied into a batch by the converter.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// When the event occurred, or when it has been observed if the source
    /// does not tell.
    pub timestamp: Timestamp,
    /// The raw or parsed payload.
    pub body: serde_json::Value,
    /// Metadata about the event (network peer, protocol, auth context, ...).
    pub attributes: Attributes,
    /// Description of the origin of the event (host, service, ...).
    pub resource: Attributes,
    pub severity: Severity,
    /// The severity as written by the source, if any.
    pub severity_text: Option<String>,
}

/// A point in time, based on the system clock.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(SystemTime);

/// Level of an [`Entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Default,
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl Entry {
    /// Creates an empty entry, timestamped now.
    pub fn new() -> Self {
        Self::with_body(serde_json::Value::Null)
    }

    /// Creates an entry with the given body, timestamped now.
    pub fn with_body(body: impl Into<serde_json::Value>) -> Self {
        Self {
            timestamp: Timestamp::now(),
            body: body.into(),
            attributes: Attributes::new(),
            resource: Attributes::new(),
            severity: Severity::Default,
            severity_text: None,
        }
    }

    /// Sets an attribute, replacing the previous value if any.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Sets a resource key-value, replacing the previous value if any.
    pub fn add_resource(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.resource.insert(key.into(), value.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

impl Timestamp {
    /// Returns a `Timestamp` representing the current system time.
    pub fn now() -> Self {
        Self(SystemTime::now())
    }

    /// Number of nanoseconds since the UNIX epoch.
    ///
    /// Times before the epoch are clamped to zero.
    pub fn unix_nanos(&self) -> u64 {
        match self.0.duration_since(UNIX_EPOCH) {
            Ok(d) => u64::try_from(d.as_nanos()).unwrap_or(u64::MAX),
            Err(_) => 0,
        }
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        Self(value)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        value.0
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Severity {
    /// The OpenTelemetry `SeverityNumber` of this level.
    pub fn number(&self) -> i32 {
        match self {
            Severity::Default => 0,
            Severity::Trace => 1,
            Severity::Debug => 5,
            Severity::Info => 9,
            Severity::Warn => 13,
            Severity::Error => 17,
            Severity::Fatal => 21,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown severity '{0}'")]
pub struct UnknownSeverity(String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    /// Parses the usual names of log levels, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Severity::Default),
            "trace" => Ok(Severity::Trace),
            "debug" => Ok(Severity::Debug),
            "info" | "information" | "notice" => Ok(Severity::Info),
            "warn" | "warning" => Ok(Severity::Warn),
            "error" | "err" => Ok(Severity::Error),
            "fatal" | "critical" | "crit" | "emergency" => Ok(Severity::Fatal),
            _ => Err(UnknownSeverity(s.to_owned())),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Default => "default",
            Severity::Trace => "trace",
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}
