use crate::types::JobId;
use std::{io, path::PathBuf, result, time::Duration};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("no job ids left")]
    IdsExhausted,
    #[error("creating job directory {}: {source}", path.display())]
    DirectoryCreation { path: PathBuf, source: io::Error },
    /// The runner's own error, passed through untouched.
    #[error(transparent)]
    SpawnLaunch(io::Error),
    #[error("spawn helper said {got:?}, expected {expected:?}")]
    UnexpectedReadiness { expected: &'static str, got: String },
    #[error("spawn helper closed its output while waiting for {expected:?}")]
    SpawnExited { expected: &'static str },
    #[error("spawn helper not ready after {0:?}")]
    ReadinessTimeout(Duration),
    #[error("link to job {job_id}: {reason}")]
    LinkInvocation { job_id: JobId, reason: LinkFailure },
}

#[derive(Error, Debug)]
pub enum LinkFailure {
    #[error("no such job")]
    UnknownJob,
    #[error("working directory {} is gone", .0.display())]
    MissingWorkingDir(PathBuf),
    #[error("launching link helper: {0}")]
    Launch(io::Error),
    #[error("collecting link helper output: {0}")]
    Collect(io::Error),
}

impl JobError {
    pub(crate) fn link(job_id: JobId, reason: LinkFailure) -> Self {
        JobError::LinkInvocation { job_id, reason }
    }
}

pub type Result<T> = result::Result<T, JobError>;
