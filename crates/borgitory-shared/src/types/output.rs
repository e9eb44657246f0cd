//! Output line model for child-process streaming.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    #[display("stdout")]
    Stdout,
    #[display("stderr")]
    Stderr,
    /// Lines synthesized by the orchestrator itself (summaries, warnings)
    #[display("meta")]
    Meta,
}

/// One captured line of job output.
///
/// `seq` is assigned at append time and is monotonic and dense per job,
/// which lets follow streams resume from a cursor without duplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub seq: u64,
    pub stream: OutputStream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputLine {
    pub fn new(seq: u64, stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            seq,
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}
