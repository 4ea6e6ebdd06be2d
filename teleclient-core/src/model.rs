use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::tags::TelemetryTags;

/// Identifies the logical transaction a telemetry item belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryOperation {
    pub id: String,
    pub name: String,
    pub parent_id: String,
}

impl TelemetryOperation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SeverityLevel {
    Verbose,
    Information,
    Warning,
    Error,
    Critical,
}

impl SeverityLevel {
    /// Numeric level used on the wire (0 = Verbose .. 4 = Critical).
    pub fn as_wire(self) -> u8 {
        match self {
            Self::Verbose => 0,
            Self::Information => 1,
            Self::Warning => 2,
            Self::Error => 3,
            Self::Critical => 4,
        }
    }
}

impl TryFrom<i32> for SeverityLevel {
    type Error = TelemetryError;

    fn try_from(v: i32) -> Result<Self, TelemetryError> {
        match v {
            0 => Ok(Self::Verbose),
            1 => Ok(Self::Information),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Error),
            4 => Ok(Self::Critical),
            other => Err(TelemetryError::InvalidArgument(format!(
                "severity level {other} is out of range 0..=4"
            ))),
        }
    }
}

impl FromStr for SeverityLevel {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "verbose" => Ok(Self::Verbose),
            "information" | "info" => Ok(Self::Information),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(TelemetryError::InvalidArgument(format!(
                "unknown severity level '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Verbose => "Verbose",
            Self::Information => "Information",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
        };
        f.write_str(s)
    }
}

/// A captured failure. `causes` holds the `source()` chain, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDetails {
    pub type_name: String,
    pub message: String,
    pub causes: Vec<String>,
}

impl ExceptionDetails {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            causes: Vec::new(),
        }
    }

    /// Capture an error value together with its `source()` chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut causes = Vec::new();
        let mut next = err.source();
        while let Some(cause) = next {
            causes.push(cause.to_string());
            next = cause.source();
        }
        Self {
            type_name: short_type_name(std::any::type_name::<E>()),
            message: err.to_string(),
            causes,
        }
    }

    /// Capture an `anyhow::Error`, keeping its context chain as causes.
    pub fn from_anyhow(err: &anyhow::Error, type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: err.to_string(),
            causes: err.chain().skip(1).map(|c| c.to_string()).collect(),
        }
    }
}

fn short_type_name(full: &str) -> String {
    // "core::fmt::Error" -> "Error", keeping generic arguments intact
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(idx) => full[idx + 2..].to_string(),
        None => full.to_string(),
    }
}

/// Variant-specific payload of a telemetry item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryData {
    Trace {
        message: String,
        severity: SeverityLevel,
    },
    Event {
        name: String,
    },
    Request {
        duration: Duration,
        id: String,
        uri: Url,
        response_code: String,
        success: bool,
        name: Option<String>,
    },
    Exception {
        details: ExceptionDetails,
    },
    DependencyInProc {
        duration: Duration,
        id: String,
        name: String,
        success: bool,
    },
    DependencyHttp {
        duration: Duration,
        id: String,
        method: String,
        uri: Url,
        status_code: u16,
        success: bool,
    },
    PageView {
        duration: Duration,
        id: String,
        name: String,
        uri: Url,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Trace,
    Event,
    Request,
    Exception,
    DependencyInProc,
    DependencyHttp,
    PageView,
}

/// One unit of telemetry. Owned by the buffer once tracked and never edited
/// afterwards; `tags` is a snapshot taken at Track time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryItem {
    pub time: DateTime<Utc>,
    pub tags: TelemetryTags,
    pub data: TelemetryData,
}

impl TelemetryItem {
    pub fn new(time: DateTime<Utc>, tags: TelemetryTags, data: TelemetryData) -> Self {
        Self { time, tags, data }
    }

    pub fn kind(&self) -> ItemKind {
        match &self.data {
            TelemetryData::Trace { .. } => ItemKind::Trace,
            TelemetryData::Event { .. } => ItemKind::Event,
            TelemetryData::Request { .. } => ItemKind::Request,
            TelemetryData::Exception { .. } => ItemKind::Exception,
            TelemetryData::DependencyInProc { .. } => ItemKind::DependencyInProc,
            TelemetryData::DependencyHttp { .. } => ItemKind::DependencyHttp,
            TelemetryData::PageView { .. } => ItemKind::PageView,
        }
    }

    pub fn operation_id(&self) -> Option<&str> {
        self.tags.operation_id()
    }

    pub fn operation_parent_id(&self) -> Option<&str> {
        self.tags.operation_parent_id()
    }

    /// Duration for the kinds that carry one.
    pub fn duration(&self) -> Option<Duration> {
        match &self.data {
            TelemetryData::Request { duration, .. }
            | TelemetryData::DependencyInProc { duration, .. }
            | TelemetryData::DependencyHttp { duration, .. }
            | TelemetryData::PageView { duration, .. } => Some(*duration),
            _ => None,
        }
    }
}
