use crate::errors::SandboxError;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

/// Everything a worker needs to run one compiled call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPayload {
    pub command: String,
    pub args: Vec<String>,
    pub mapping: BTreeMap<String, i64>,
    /// Worker-relative working directory.
    pub cwd: Option<String>,
    /// Tar of the algorithm's installed files.
    pub app_archive: Option<Vec<u8>>,
    /// Materialized input files, sent under their file names.
    pub files: Vec<PathBuf>,
}

pub type JobOutcome = Result<Option<i32>, SandboxError>;

/// A payload plus where its result archive goes and whom to tell when done.
/// Consumed by exactly one container handle.
pub struct Job {
    pub payload: JobPayload,
    pub timeout: Duration,
    pub output: Box<dyn AsyncWrite + Send + Unpin>,
    done: oneshot::Sender<JobOutcome>,
}

impl Job {
    pub fn new(
        payload: JobPayload,
        timeout: Duration,
        output: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                payload,
                timeout,
                output,
                done,
            },
            rx,
        )
    }

    /// Reports the outcome. The submitter may have gone away, which is fine.
    pub fn finish(self, outcome: JobOutcome) {
        let _ = self.done.send(outcome);
    }

    pub(crate) fn split(self) -> (JobPayload, Duration, Box<dyn AsyncWrite + Send + Unpin>, Completion) {
        (self.payload, self.timeout, self.output, Completion(self.done))
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("command", &self.payload.command)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// The completion half of a job after its payload has been taken.
pub(crate) struct Completion(oneshot::Sender<JobOutcome>);

impl Completion {
    pub(crate) fn send(self, outcome: JobOutcome) {
        let _ = self.0.send(outcome);
    }
}
