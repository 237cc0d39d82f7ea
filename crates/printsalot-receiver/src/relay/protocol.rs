//! Typed relay events.
//!
//! Relay → client: `welcome`, `print_job`, `token_issued`, `token_rotated`.
//! Client → relay: `update_settings`, `job_update`.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use printsalot_core::PrinterSettings;

use super::error::RelayError;

/// Auth payload sent with every connect attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub settings: PrinterSettings,
}

/// Pairing information sent right after the relay accepts the connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Welcome {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub linked: bool,
}

/// One unit of print work pushed by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub job_id: String,
    /// HTTP(S) URL or base64 image data, optionally with a data-URI header.
    pub content: String,
    pub auto_cut: bool,
}

#[derive(Deserialize)]
struct RawPrintJob {
    #[serde(default, deserialize_with = "string_or_number")]
    job_id: Option<String>,
    #[serde(default)]
    content: Option<String>,
    /// Older relays send the image location here.
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default = "default_auto_cut")]
    auto_cut: bool,
}

const fn default_auto_cut() -> bool {
    true
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl TryFrom<RawPrintJob> for PrintJob {
    type Error = RelayError;

    fn try_from(raw: RawPrintJob) -> Result<Self, Self::Error> {
        let job_id = raw
            .job_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| RelayError::Protocol("print_job without job_id".into()))?;
        let content = raw
            .content
            .filter(|c| !c.is_empty())
            .or(raw.file_url)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RelayError::Protocol(format!("print_job {job_id} has no content")))?;
        Ok(Self {
            job_id,
            content,
            auto_cut: raw.auto_cut,
        })
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
}

/// Application event received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Welcome(Welcome),
    PrintJob(PrintJob),
    TokenIssued(String),
    TokenRotated(String),
    /// Event name this client does not handle.
    Unknown(String),
}

impl InboundEvent {
    /// Build a typed event from a decoded `["name", data]` pair.
    pub fn from_event(name: &str, data: Value) -> Result<Self, RelayError> {
        let invalid = |e: serde_json::Error| RelayError::Protocol(format!("invalid {name} payload: {e}"));
        match name {
            "welcome" => Ok(Self::Welcome(serde_json::from_value(data).map_err(invalid)?)),
            "print_job" => {
                let raw: RawPrintJob = serde_json::from_value(data).map_err(invalid)?;
                Ok(Self::PrintJob(raw.try_into()?))
            }
            "token_issued" => {
                let p: TokenPayload = serde_json::from_value(data).map_err(invalid)?;
                Ok(Self::TokenIssued(p.token))
            }
            "token_rotated" => {
                let p: TokenPayload = serde_json::from_value(data).map_err(invalid)?;
                Ok(Self::TokenRotated(p.token))
            }
            other => Ok(Self::Unknown(other.to_string())),
        }
    }
}

/// Why a job failed, as reported to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    OutOfPaper,
    Error,
}

/// Terminal status of a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed(FailureReason),
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed(FailureReason::OutOfPaper) => f.write_str("failed/out_of_paper"),
            Self::Failed(FailureReason::Error) => f.write_str("failed/error"),
        }
    }
}

/// `job_update` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobUpdate {
    pub job_id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl JobUpdate {
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        let (status, reason) = match status {
            JobStatus::Completed => ("completed", None),
            JobStatus::Failed(reason) => ("failed", Some(reason)),
        };
        Self {
            job_id: job_id.into(),
            status,
            reason,
        }
    }
}

/// Application event sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    UpdateSettings(PrinterSettings),
    JobUpdate(JobUpdate),
}

impl OutboundEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::UpdateSettings(_) => "update_settings",
            Self::JobUpdate(_) => "job_update",
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::UpdateSettings(settings) => serde_json::to_value(settings),
            Self::JobUpdate(update) => serde_json::to_value(update),
        }
    }
}
