//! Verdict types and the result payload published to Redis.

use serde::{Deserialize, Serialize};

/// Outcome of scanning one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No threats detected.
    Clean,
    /// A threat was found.
    Infected {
        /// Signature name reported by the engine.
        virus: String,
    },
    /// The scan could not be completed.
    Error {
        /// Human-readable failure description.
        detail: String,
    },
}

impl Verdict {
    /// Returns `true` for a clean verdict.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Clean)
    }

    /// Returns `true` for an infected verdict.
    pub fn is_infected(&self) -> bool {
        matches!(self, Self::Infected { .. })
    }

    /// Metric label value for this verdict.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Clean => "CLEAN",
            Self::Infected { .. } => "INFECTED",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Parses a clamd INSTREAM reply line.
    ///
    /// Expected forms: `stream: OK`, `stream: Eicar-Signature FOUND`,
    /// `INSTREAM size limit exceeded. ERROR`.
    pub fn from_clamd_reply(reply: &str) -> Self {
        let reply = reply.trim().trim_end_matches('\0');
        if reply.ends_with("OK") {
            Self::Clean
        } else if reply.ends_with("FOUND") {
            let virus = reply
                .rsplit_once(':')
                .map(|(_, rest)| rest)
                .unwrap_or(reply)
                .trim_end_matches("FOUND")
                .trim()
                .to_string();
            Self::Infected { virus }
        } else {
            Self::Error {
                detail: reply.to_string(),
            }
        }
    }
}

/// Wire value of the `status` field in the result payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictStatus {
    /// Admit the traffic.
    Clean,
    /// Block the traffic.
    Infected,
    /// Scan failed; the producer decides via `failure_mode_allow`.
    Error,
}

/// Timings attached to a published result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanMetrics {
    /// Engine round-trip for the scan itself, milliseconds.
    pub scan_ms: u64,
    /// Enqueue-to-verdict turn-around, milliseconds.
    pub total_tat_ms: u64,
}

/// The JSON document stored at `result:<task_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictRecord {
    /// Scan outcome.
    pub status: VerdictStatus,
    /// Signature name, present only for INFECTED.
    pub virus: Option<String>,
    /// Failure description, present only for ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Verified-chunk list key retained for downstream reuse, CLEAN only.
    pub data_key: Option<String>,
    /// Scan and turn-around timings.
    #[serde(default)]
    pub metrics: ScanMetrics,
}

impl VerdictRecord {
    /// Builds the record for a verdict.
    pub fn new(verdict: &Verdict, data_key: Option<String>, metrics: ScanMetrics) -> Self {
        match verdict {
            Verdict::Clean => Self {
                status: VerdictStatus::Clean,
                virus: None,
                detail: None,
                data_key,
                metrics,
            },
            Verdict::Infected { virus } => Self {
                status: VerdictStatus::Infected,
                virus: Some(virus.clone()),
                detail: None,
                data_key: None,
                metrics,
            },
            Verdict::Error { detail } => Self {
                status: VerdictStatus::Error,
                virus: None,
                detail: Some(detail.clone()),
                data_key: None,
                metrics,
            },
        }
    }

    /// Serializes to the wire JSON.
    pub fn to_json(&self) -> String {
        // A struct of strings and integers cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"status":"ERROR","virus":null,"data_key":null,"metrics":{"scan_ms":0,"total_tat_ms":0}}"#
                .to_string()
        })
    }

    /// Parses the wire JSON.
    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}
