//! # Event Model
//!
//! Every lifecycle transition in the engine publishes one of these through
//! the broadcaster. Consumers are free to serialize events to SSE,
//! websockets, or any other transport; `to_json` gives the wire shape.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::job::{JobId, JobStatus};

/// Event type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[display("job_started")]
    JobStarted,
    #[display("job_status_changed")]
    JobStatusChanged,
    #[display("job_completed")]
    JobCompleted,
    #[display("job_failed")]
    JobFailed,
    #[display("job_stopped")]
    JobStopped,
    #[display("job_queued")]
    JobQueued,
    #[display("job_admitted")]
    JobAdmitted,
    #[display("task_started")]
    TaskStarted,
    #[display("task_output")]
    TaskOutput,
    #[display("task_completed")]
    TaskCompleted,
    #[display("keep_alive")]
    KeepAlive,
}

/// A structured event on the broadcast stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub event_type: EventType,
    pub job_id: Option<JobId>,
    pub task_index: Option<usize>,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(event_type: EventType, job_id: Option<JobId>) -> Self {
        Self {
            event_type,
            job_id,
            task_index: None,
            data: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_index: usize) -> Self {
        self.task_index = Some(task_index);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn job_status_changed(job_id: JobId, status: JobStatus) -> Self {
        Self::new(EventType::JobStatusChanged, Some(job_id))
            .with_data(json!({ "status": status.to_string() }))
    }

    pub fn keep_alive() -> Self {
        Self::new(EventType::KeepAlive, None)
    }

    /// Wire shape: `{type, job_id?, task_index?, data, timestamp}` with an
    /// ISO-8601 timestamp
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "type": self.event_type.to_string(),
            "job_id": self.job_id.map(|id| id.as_hex()),
            "task_index": self.task_index,
            "data": self.data,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let id = JobId::new();
        let event = JobEvent::new(EventType::TaskOutput, Some(id))
            .with_task(2)
            .with_data(json!({ "line": "Archive created" }));
        let wire = event.to_json();

        assert_eq!(wire["type"], "task_output");
        assert_eq!(wire["job_id"], id.as_hex());
        assert_eq!(wire["task_index"], 2);
        assert_eq!(wire["data"]["line"], "Archive created");
        assert!(wire["timestamp"].as_str().expect("ts").contains('T'));
    }

    #[test]
    fn test_keep_alive_has_no_job() {
        let event = JobEvent::keep_alive();
        assert_eq!(event.event_type, EventType::KeepAlive);
        assert!(event.job_id.is_none());
    }
}
