use std::path::PathBuf;

pub type Program = String;
pub type Args = Vec<String>;
pub type JobId = u32;
pub type OutputBlob = bytes::Bytes;
pub type Dir = PathBuf;

/// Input attached to a helper process: any async byte source.
pub type Input = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Everything one link helper run reports about a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkOutput {
    pub exit_status: u32,
    pub stdout: OutputBlob,
    pub stderr: OutputBlob,
}
