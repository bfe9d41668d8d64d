use async_trait::async_trait;
use std::{fmt, io};
use tokio::io::{AsyncRead, AsyncWrite};

/// Identifies one process's set of channels.
pub type StreamId = u32;

pub type Conn = Box<dyn AsyncWrite + Send + Unpin>;
pub type Source = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamName {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamName::Stdin => "stdin",
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A channel taken over for raw bytes: `conn` writes into it, `source` reads out of it.
pub struct Hijacked {
    pub conn: Conn,
    pub source: Source,
}

/// Takes exclusive control of one named channel of a process.
#[async_trait]
pub trait Hijack: Send + Sync + 'static {
    async fn hijack(&self, stream_id: StreamId, stream: StreamName) -> io::Result<Hijacked>;
}
