use crate::hijack::{Hijack, Hijacked, StreamId, StreamName};
use async_trait::async_trait;
use protobuf::attach_request::Channel as AttachChannel;
use protobuf::jobs_client::JobsClient;
use protobuf::{AttachRequest, Chunk};
use std::io;
use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};
use tonic::{transport::Channel, Code, Status, Streaming};
use tracing::warn;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Attaches to job channels through the server's `Attach` call.
///
/// Output channels are read-only over gRPC, so the write half handed back is a sink.
#[derive(Clone)]
pub struct GrpcHijacker {
    client: JobsClient<Channel>,
}

impl GrpcHijacker {
    pub fn new(client: JobsClient<Channel>) -> Self {
        Self { client }
    }

    /// Open the control channel for `job_id`, ready to hand to `StreamHandler::wait`.
    pub async fn completion(&self, job_id: StreamId) -> io::Result<BufReader<DuplexStream>> {
        let pipe = self.open(job_id, AttachChannel::Control).await?;
        Ok(BufReader::new(pipe))
    }

    async fn open(&self, job_id: StreamId, channel: AttachChannel) -> io::Result<DuplexStream> {
        let request = AttachRequest {
            job_id,
            channel: channel as i32,
        };
        let stream = self
            .client
            .clone()
            .attach(request)
            .await
            .map_err(status_to_io)?
            .into_inner();
        Ok(pump(job_id, channel, stream))
    }
}

#[async_trait]
impl Hijack for GrpcHijacker {
    async fn hijack(&self, stream_id: StreamId, stream: StreamName) -> io::Result<Hijacked> {
        let channel = match stream {
            StreamName::Stdin => AttachChannel::Stdin,
            StreamName::Stdout => AttachChannel::Stdout,
            StreamName::Stderr => AttachChannel::Stderr,
        };
        let source = self.open(stream_id, channel).await?;
        Ok(Hijacked {
            conn: Box::new(tokio::io::sink()),
            source: Box::new(source),
        })
    }
}

/// Copy a chunk stream into an in-memory pipe and return the read end.
fn pump(job_id: StreamId, channel: AttachChannel, mut stream: Streaming<Chunk>) -> DuplexStream {
    let (mut tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(async move {
        loop {
            match stream.message().await {
                Ok(Some(Chunk { data })) => {
                    if tx.write_all(&data).await.is_err() {
                        // reader went away
                        break;
                    }
                }
                Ok(None) => break,
                Err(status) => {
                    warn!(job_id, ?channel, %status, "attach stream broke off");
                    break;
                }
            }
        }
        let _ = tx.shutdown().await;
    });
    rx
}

fn status_to_io(status: Status) -> io::Error {
    let kind = match status.code() {
        Code::NotFound => io::ErrorKind::NotFound,
        Code::Unimplemented => io::ErrorKind::Unsupported,
        Code::InvalidArgument => io::ErrorKind::InvalidInput,
        Code::Unavailable => io::ErrorKind::ConnectionRefused,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, status.message().to_string())
}
