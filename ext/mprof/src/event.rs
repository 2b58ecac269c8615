//! Metadata document uploaded alongside the pprof bytes.

use chrono::{SecondsFormat, TimeZone, Utc};

use crate::error::Result;
use crate::session::EncodedProfile;

/// Attachment name under which the pprof bytes are uploaded.
pub const WALL_FILENAME: &str = "wall.pprof";
pub const EVENT_VERSION: &str = "4";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Launch,
    Continuous,
}

impl Operation {
    fn tag_value(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Continuous => "continuous",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventContext {
    pub service: String,
    pub version: String,
    pub sdk_version: String,
    pub env: String,
    pub source: String,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileEvent {
    pub attachments: Vec<String>,
    pub family: String,
    pub runtime: String,
    pub version: String,
    #[serde(rename = "tags_profiler")]
    pub tags: String,
    pub start: String,
    pub end: String,
}

impl ProfileEvent {
    pub fn new(context: &EventContext, profile: &EncodedProfile, operation: Operation) -> Self {
        let tags = [
            format!("service:{}", context.service),
            format!("version:{}", context.version),
            format!("sdk_version:{}", context.sdk_version),
            format!("env:{}", context.env),
            format!("source:{}", context.source),
            format!("language:{}", context.language),
            "format:pprof".to_string(),
            "remote_symbols:yes".to_string(),
            format!("operation:{}", operation.tag_value()),
        ]
        .join(",");

        Self {
            attachments: vec![WALL_FILENAME.to_string()],
            family: context.source.clone(),
            runtime: context.source.clone(),
            version: EVENT_VERSION.to_string(),
            tags,
            start: format_timestamp(profile.start),
            end: format_timestamp(profile.end.max(profile.start)),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn format_timestamp(epoch_ns: u64) -> String {
    let nanos = i64::try_from(epoch_ns).unwrap_or(i64::MAX);
    Utc.timestamp_nanos(nanos)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}
