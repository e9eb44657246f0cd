//! # Output Manager
//!
//! One ring buffer per job, bounded at `max_output_lines_per_job`. Appends
//! are O(1); on overflow the oldest line is discarded and a truncation
//! counter increments. Sequence numbers are assigned at append time and are
//! monotonic and dense per job, so follow cursors can resume without
//! duplication. Followers are woken through a `Notify` and finish once the
//! job closes its buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;

use borgitory_shared::types::{JobId, OutputLine, OutputStream};

/// Point-in-time view of a job's output
#[derive(Debug, Clone)]
pub struct OutputSnapshot {
    pub lines: Vec<OutputLine>,
    pub truncated_count: u64,
}

#[derive(Debug)]
struct OutputState {
    lines: VecDeque<OutputLine>,
    next_seq: u64,
    truncated: u64,
    closed: bool,
}

/// Ring buffer plus wakeup for one job
#[derive(Debug)]
pub struct JobOutput {
    state: Mutex<OutputState>,
    notify: Notify,
    max_lines: usize,
}

impl JobOutput {
    fn new(max_lines: usize) -> Self {
        Self {
            state: Mutex::new(OutputState {
                lines: VecDeque::with_capacity(max_lines.min(64)),
                next_seq: 0,
                truncated: 0,
                closed: false,
            }),
            notify: Notify::new(),
            max_lines,
        }
    }

    fn append(&self, stream: OutputStream, text: &str) -> OutputLine {
        let line = {
            let mut state = self.state.lock().expect("output lock");
            let line = OutputLine::new(state.next_seq, stream, text);
            state.next_seq += 1;
            if state.lines.len() == self.max_lines {
                state.lines.pop_front();
                state.truncated += 1;
            }
            state.lines.push_back(line.clone());
            line
        };
        self.notify.notify_waiters();
        line
    }

    fn snapshot(&self, tail: Option<usize>) -> OutputSnapshot {
        let state = self.state.lock().expect("output lock");
        let skip = match tail {
            Some(n) if n < state.lines.len() => state.lines.len() - n,
            _ => 0,
        };
        OutputSnapshot {
            lines: state.lines.iter().skip(skip).cloned().collect(),
            truncated_count: state.truncated,
        }
    }

    fn close(&self) {
        self.state.lock().expect("output lock").closed = true;
        self.notify.notify_waiters();
    }
}

/// Live follow cursor over one job's output. Each caller gets an
/// independent cursor; the stream ends when the job's buffer is closed.
#[derive(Debug)]
pub struct OutputFollower {
    output: Arc<JobOutput>,
    cursor: u64,
}

impl OutputFollower {
    /// Next line at or past the cursor, or `None` once the job has ended
    /// and everything buffered has been yielded. Lines that were truncated
    /// out of the ring before being read are skipped.
    pub async fn next(&mut self) -> Option<OutputLine> {
        loop {
            let notified = self.output.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so an append between the
            // check and the await still wakes us.
            notified.as_mut().enable();
            {
                let state = self.output.state.lock().expect("output lock");
                if let Some(line) = state.lines.iter().find(|l| l.seq >= self.cursor) {
                    self.cursor = line.seq + 1;
                    return Some(line.clone());
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

/// Per-job output buffers for every live job
#[derive(Debug)]
pub struct JobOutputManager {
    buffers: DashMap<JobId, Arc<JobOutput>>,
    max_lines: usize,
}

impl JobOutputManager {
    pub fn new(max_lines: usize) -> Self {
        Self {
            buffers: DashMap::new(),
            max_lines,
        }
    }

    /// Create the buffer for a job; idempotent
    pub fn create(&self, job_id: JobId) {
        self.buffers
            .entry(job_id)
            .or_insert_with(|| Arc::new(JobOutput::new(self.max_lines)));
    }

    /// Append a line, returning it with its assigned sequence number.
    /// Unknown jobs are ignored (cleanup may have raced a late line).
    pub fn append(&self, job_id: JobId, stream: OutputStream, text: &str) -> Option<OutputLine> {
        self.buffers.get(&job_id).map(|o| o.append(stream, text))
    }

    pub fn snapshot(&self, job_id: JobId, tail: Option<usize>) -> Option<OutputSnapshot> {
        self.buffers.get(&job_id).map(|o| o.snapshot(tail))
    }

    /// Historical buffer then live additions until the job terminates
    pub fn follow(&self, job_id: JobId) -> Option<OutputFollower> {
        self.buffers.get(&job_id).map(|o| OutputFollower {
            output: o.clone(),
            cursor: 0,
        })
    }

    /// Mark the job's buffer complete, ending all followers
    pub fn close(&self, job_id: JobId) {
        if let Some(output) = self.buffers.get(&job_id) {
            output.close();
        }
    }

    /// Drop the buffer; called from cleanup. Existing followers end.
    pub fn clear(&self, job_id: JobId) {
        if let Some((_, output)) = self.buffers.remove(&job_id) {
            output.close();
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}
