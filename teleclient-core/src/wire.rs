//! Ingestion wire format: one envelope per item, posted as a JSON array.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ExceptionDetails, TelemetryData, TelemetryItem};
use crate::tags::{TelemetryTags, keys};

const SDK_VERSION: &str = concat!("teleclient:", env!("CARGO_PKG_VERSION"));

const MAX_NAME_LEN: usize = 1024;
const MAX_MESSAGE_LEN: usize = 32_768;
const MAX_URL_LEN: usize = 2048;

/// System fields of a telemetry item plus its typed payload.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Type name of the telemetry data item.
    pub name: &'static str,
    /// UTC ISO 8601 time the item was created, with a trailing 'Z'.
    pub time: String,
    /// Instrumentation key of the destination.
    pub i_key: String,
    pub tags: BTreeMap<String, String>,
    pub data: Data,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Data {
    pub base_type: &'static str,
    pub base_data: BaseData,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BaseData {
    Message(MessageData),
    Event(EventData),
    Request(RequestData),
    Exception(ExceptionData),
    RemoteDependency(RemoteDependencyData),
    PageView(PageViewData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub ver: u8,
    pub message: String,
    pub severity_level: u8,
}

#[derive(Debug, Serialize)]
pub struct EventData {
    pub ver: u8,
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub ver: u8,
    pub id: String,
    pub name: String,
    pub duration: String,
    pub response_code: String,
    pub success: bool,
    pub url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    pub ver: u8,
    pub exceptions: Vec<ExceptionEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionEntry {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outer_id: Option<u32>,
    pub type_name: String,
    pub message: String,
    pub has_full_stack: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDependencyData {
    pub ver: u8,
    pub id: String,
    pub name: String,
    pub duration: String,
    pub success: bool,
    #[serde(rename = "type")]
    pub type_: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageViewData {
    pub ver: u8,
    pub id: String,
    pub name: String,
    pub url: String,
    pub duration: String,
}

/// Body returned by the ingestion endpoint on 200/206.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackResponse {
    #[serde(default)]
    pub items_received: u64,
    /// Absent when the endpoint does not report a count.
    #[serde(default)]
    pub items_accepted: Option<u64>,
    #[serde(default)]
    pub errors: Vec<TrackError>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackError {
    pub index: u64,
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
}

impl Envelope {
    /// Build the envelope for one item. Tag precedence, lowest first:
    /// SDK version, publisher tags, item tags.
    pub fn from_item(item: &TelemetryItem, i_key: &str, publisher_tags: &TelemetryTags) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert(keys::INTERNAL_SDK_VERSION.to_string(), SDK_VERSION.to_string());
        for (k, v) in publisher_tags.iter().chain(item.tags.iter()) {
            tags.insert(k.to_string(), v.to_string());
        }

        let (name, base_type, base_data) = match &item.data {
            TelemetryData::Trace { message, severity } => (
                "Microsoft.ApplicationInsights.Message",
                "MessageData",
                BaseData::Message(MessageData {
                    ver: 2,
                    message: truncate(message, MAX_MESSAGE_LEN),
                    severity_level: severity.as_wire(),
                }),
            ),
            TelemetryData::Event { name } => (
                "Microsoft.ApplicationInsights.Event",
                "EventData",
                BaseData::Event(EventData {
                    ver: 2,
                    name: truncate(name, MAX_NAME_LEN),
                }),
            ),
            TelemetryData::Request {
                duration,
                id,
                uri,
                response_code,
                success,
                name,
            } => (
                "Microsoft.ApplicationInsights.Request",
                "RequestData",
                BaseData::Request(RequestData {
                    ver: 2,
                    id: id.clone(),
                    name: truncate(name.as_deref().unwrap_or(uri.as_str()), MAX_NAME_LEN),
                    duration: duration_to_string(*duration),
                    response_code: response_code.clone(),
                    success: *success,
                    url: truncate(uri.as_str(), MAX_URL_LEN),
                }),
            ),
            TelemetryData::Exception { details } => (
                "Microsoft.ApplicationInsights.Exception",
                "ExceptionData",
                BaseData::Exception(ExceptionData {
                    ver: 2,
                    exceptions: exception_entries(details),
                }),
            ),
            TelemetryData::DependencyInProc {
                duration,
                id,
                name,
                success,
            } => (
                "Microsoft.ApplicationInsights.RemoteDependency",
                "RemoteDependencyData",
                BaseData::RemoteDependency(RemoteDependencyData {
                    ver: 2,
                    id: id.clone(),
                    name: truncate(name, MAX_NAME_LEN),
                    duration: duration_to_string(*duration),
                    success: *success,
                    type_: "InProc",
                    result_code: None,
                    data: None,
                    target: None,
                }),
            ),
            TelemetryData::DependencyHttp {
                duration,
                id,
                method,
                uri,
                status_code,
                success,
            } => (
                "Microsoft.ApplicationInsights.RemoteDependency",
                "RemoteDependencyData",
                BaseData::RemoteDependency(RemoteDependencyData {
                    ver: 2,
                    id: id.clone(),
                    name: truncate(&format!("{method} {}", uri.path()), MAX_NAME_LEN),
                    duration: duration_to_string(*duration),
                    success: *success,
                    type_: "HTTP",
                    result_code: Some(status_code.to_string()),
                    data: Some(truncate(uri.as_str(), MAX_URL_LEN)),
                    target: uri.host_str().map(|h| match uri.port() {
                        Some(port) => format!("{h}:{port}"),
                        None => h.to_string(),
                    }),
                }),
            ),
            TelemetryData::PageView {
                duration,
                id,
                name,
                uri,
            } => (
                "Microsoft.ApplicationInsights.PageView",
                "PageViewData",
                BaseData::PageView(PageViewData {
                    ver: 2,
                    id: id.clone(),
                    name: truncate(name, MAX_NAME_LEN),
                    url: truncate(uri.as_str(), MAX_URL_LEN),
                    duration: duration_to_string(*duration),
                }),
            ),
        };

        Envelope {
            name,
            time: time_to_string(item.time),
            i_key: i_key.to_string(),
            tags,
            data: Data {
                base_type,
                base_data,
            },
        }
    }
}

fn exception_entries(details: &ExceptionDetails) -> Vec<ExceptionEntry> {
    let mut out = Vec::with_capacity(1 + details.causes.len());
    out.push(ExceptionEntry {
        id: 0,
        outer_id: None,
        type_name: details.type_name.clone(),
        message: truncate(&details.message, MAX_MESSAGE_LEN),
        has_full_stack: false,
    });
    for (i, cause) in details.causes.iter().enumerate() {
        let id = i as u32 + 1;
        out.push(ExceptionEntry {
            id,
            outer_id: Some(id - 1),
            type_name: "Cause".to_string(),
            message: truncate(cause, MAX_MESSAGE_LEN),
            has_full_stack: false,
        });
    }
    out
}

/// `d.hh:mm:ss.fffffff`
pub fn duration_to_string(d: Duration) -> String {
    let secs = d.as_secs();
    let ticks = d.subsec_nanos() / 100;
    format!(
        "{}.{:02}:{:02}:{:02}.{:07}",
        secs / 86_400,
        (secs / 3_600) % 24,
        (secs / 60) % 60,
        secs % 60,
        ticks
    )
}

pub fn time_to_string(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
