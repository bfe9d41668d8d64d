use futures::Stream;
use joblib::errors::{JobError, LinkFailure};
use joblib::runner::{Output, ProcessHandle};
use joblib::types::{Input, JobId, LinkOutput};
use joblib::JobTracker;
use protobuf::attach_request::Channel;
use protobuf::jobs_server::Jobs;
use protobuf::{
    AttachRequest, Chunk, CompletionMessage, LinkRequest, LinkResponse, SpawnRequest,
    SpawnResponse,
};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

/// Largest `Chunk` sent on an attach stream.
const CHUNK_SIZE: usize = 32 * 1024;

pub struct JobsService {
    tracker: Arc<JobTracker>,
}

impl JobsService {
    pub fn new(tracker: Arc<JobTracker>) -> Self {
        Self { tracker }
    }

    async fn link_output(&self, job_id: JobId) -> Result<LinkOutput, Status> {
        self.tracker.link(job_id).await.map_err(|err| {
            warn!(job_id, %err, "link failed");
            job_error_to_status(err)
        })
    }

    /// Start the link helper and stream one of its outputs as it is produced.
    async fn live_output(&self, job_id: JobId, channel: Channel) -> Result<Output, Status> {
        let ProcessHandle {
            stdout,
            stderr,
            exit,
            ..
        } = self.tracker.link_streams(job_id).await.map_err(|err| {
            warn!(job_id, %err, "link failed");
            job_error_to_status(err)
        })?;
        let (wanted, mut unwanted) = match channel {
            Channel::Stderr => (stderr, stdout),
            _ => (stdout, stderr),
        };
        // the helper must not block on the stream nobody asked for
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut unwanted, &mut tokio::io::sink()).await;
            match exit.await {
                Ok(code) => debug!(job_id, ?channel, code, "link helper finished"),
                Err(err) => warn!(job_id, ?channel, %err, "lost track of link helper"),
            }
        });
        Ok(wanted)
    }

    async fn completion_record(&self, job_id: JobId) -> Result<Vec<u8>, Status> {
        let message = match self.tracker.link(job_id).await {
            Ok(output) => CompletionMessage::exited(output.exit_status),
            Err(err) => {
                warn!(job_id, %err, "link failed, reporting it on the control channel");
                CompletionMessage::failed(err.to_string())
            }
        };
        message
            .to_record()
            .map_err(|err| Status::internal(err.to_string()))
    }
}

#[tonic::async_trait]
impl Jobs for JobsService {
    type AttachStream = Pin<Box<dyn Stream<Item = Result<Chunk, Status>> + Send + Sync>>;

    async fn spawn(&self, req: Request<SpawnRequest>) -> Result<Response<SpawnResponse>, Status> {
        let SpawnRequest { path, args, stdin } = req.into_inner();
        if path.is_empty() {
            return Err(Status::invalid_argument("missing command path"));
        }
        let stdin: Option<Input> = if stdin.is_empty() {
            None
        } else {
            Some(Box::new(Cursor::new(stdin)))
        };

        let job_id = self
            .tracker
            .spawn(path.clone(), args, stdin)
            .await
            .map_err(|err| {
                error!(%path, %err, "spawn failed");
                job_error_to_status(err)
            })?;
        info!(job_id, %path, "spawned");
        Ok(Response::new(SpawnResponse { job_id }))
    }

    async fn link(&self, req: Request<LinkRequest>) -> Result<Response<LinkResponse>, Status> {
        let LinkOutput {
            exit_status,
            stdout,
            stderr,
        } = self.link_output(req.into_inner().job_id).await?;
        Ok(Response::new(LinkResponse {
            exit_status,
            stdout: stdout.to_vec(),
            stderr: stderr.to_vec(),
        }))
    }

    async fn attach(
        &self,
        req: Request<AttachRequest>,
    ) -> Result<Response<Self::AttachStream>, Status> {
        let job_id = req.get_ref().job_id;
        let channel = req.get_ref().channel();
        if self.tracker.working_dir(job_id).is_none() {
            return Err(job_error_to_status(JobError::LinkInvocation {
                job_id,
                reason: LinkFailure::UnknownJob,
            }));
        }

        let stream: Self::AttachStream = match channel {
            Channel::Stdin => {
                return Err(Status::unimplemented(
                    "stdin is supplied when the job is spawned",
                ))
            }
            Channel::Stdout | Channel::Stderr => {
                let output = self.live_output(job_id, channel).await?;
                Box::pin(stream_chunks(job_id, channel, output))
            }
            Channel::Control => {
                let record = self.completion_record(job_id).await?;
                Box::pin(futures::stream::iter(chunked(&record)))
            }
        };
        Ok(Response::new(stream))
    }
}

/// Forward `output` as chunks while it is still being written.
fn stream_chunks(
    job_id: JobId,
    channel: Channel,
    mut output: Output,
) -> ReceiverStream<Result<Chunk, Status>> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut buf = vec![0; CHUNK_SIZE];
        loop {
            let chunk = match output.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => Ok(Chunk {
                    data: buf[..n].to_vec(),
                }),
                Err(err) => {
                    warn!(job_id, ?channel, %err, "reading link helper output failed");
                    Err(Status::internal(err.to_string()))
                }
            };
            let failed = chunk.is_err();
            if tx.send(chunk).await.is_err() {
                debug!(job_id, ?channel, "attach caller went away");
                break;
            }
            if failed {
                break;
            }
        }
    });
    ReceiverStream::new(rx)
}

fn chunked(data: &[u8]) -> Vec<Result<Chunk, Status>> {
    data.chunks(CHUNK_SIZE)
        .map(|chunk| {
            Ok(Chunk {
                data: chunk.to_vec(),
            })
        })
        .collect()
}

fn job_error_to_status(err: JobError) -> Status {
    let message = err.to_string();
    match err {
        JobError::LinkInvocation {
            reason: LinkFailure::UnknownJob,
            ..
        } => Status::not_found(message),
        JobError::LinkInvocation {
            reason: LinkFailure::MissingWorkingDir(_),
            ..
        } => Status::failed_precondition(message),
        JobError::IdsExhausted => Status::resource_exhausted(message),
        JobError::UnexpectedReadiness { .. }
        | JobError::SpawnExited { .. }
        | JobError::ReadinessTimeout(_) => Status::unavailable(message),
        JobError::DirectoryCreation { .. }
        | JobError::SpawnLaunch(_)
        | JobError::LinkInvocation { .. } => Status::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use client::errors::StreamError;
    use client::{Hijack, Hijacked, StreamHandler, StreamId, StreamName};
    use futures::{FutureExt, StreamExt, TryStreamExt};
    use joblib::runner::{CommandRunner, CommandSpec};
    use joblib::ProcessRunner;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::oneshot;
    use tonic::Code;

    fn service(root: &std::path::Path) -> JobsService {
        JobsService::new(Arc::new(JobTracker::new(root, Arc::new(ProcessRunner))))
    }

    /// Helpers that finish the spawn handshake at once. The link helper is either missing or
    /// fed by the test through `link_stdout`.
    #[derive(Default)]
    struct FakeHelpers {
        link_installed: bool,
        link_stdout: Mutex<Option<DuplexStream>>,
    }

    #[tonic::async_trait]
    impl CommandRunner for FakeHelpers {
        async fn start(&self, spec: CommandSpec) -> io::Result<ProcessHandle> {
            let (kill, _) = oneshot::channel();
            let stdout: Output = if spec.path.ends_with(joblib::SPAWN_HELPER) {
                Box::new(Cursor::new(b"ready\nactive\n".to_vec()))
            } else if self.link_installed {
                let (tx, rx) = tokio::io::duplex(1024);
                *self.link_stdout.lock().unwrap() = Some(tx);
                Box::new(rx)
            } else {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no link helper here"));
            };
            Ok(ProcessHandle {
                stdout,
                stderr: Box::new(tokio::io::empty()),
                exit: futures::future::ready(Ok(0)).boxed(),
                kill,
            })
        }
    }

    struct NoStreams;

    #[tonic::async_trait]
    impl Hijack for NoStreams {
        async fn hijack(&self, _: StreamId, _: StreamName) -> io::Result<Hijacked> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "no streams"))
        }
    }

    async fn spawn_job(service: &JobsService) -> JobId {
        let request = SpawnRequest {
            path: "/bin/true".into(),
            ..SpawnRequest::default()
        };
        service
            .spawn(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .job_id
    }

    fn attach_request(job_id: JobId, channel: Channel) -> Request<AttachRequest> {
        Request::new(AttachRequest {
            job_id,
            channel: channel as i32,
        })
    }

    #[tokio::test]
    async fn control_channel_reports_link_failures_as_records() {
        let root = tempfile::tempdir().unwrap();
        let tracker = JobTracker::new(root.path(), Arc::new(FakeHelpers::default()));
        let service = JobsService::new(Arc::new(tracker));
        let job_id = spawn_job(&service).await;

        let chunks: Vec<Chunk> = service
            .attach(attach_request(job_id, Channel::Control))
            .await
            .unwrap()
            .into_inner()
            .try_collect()
            .await
            .unwrap();
        let record: Vec<u8> = chunks.into_iter().flat_map(|chunk| chunk.data).collect();
        let text = String::from_utf8(record.clone()).unwrap();
        assert!(text.starts_with("{\"errorText\":"), "got {}", text);
        assert!(text.ends_with('\n'));
        assert!(text.contains("no link helper here"));

        let handler = StreamHandler::new(job_id, Arc::new(NoStreams));
        match handler.wait(&record[..]).await {
            Err(StreamError::Process(message)) => {
                assert!(message.contains("no link helper here"), "got {}", message)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn attach_streams_output_while_the_job_runs() {
        let root = tempfile::tempdir().unwrap();
        let helpers = Arc::new(FakeHelpers {
            link_installed: true,
            ..FakeHelpers::default()
        });
        let tracker = JobTracker::new(root.path(), helpers.clone());
        let service = JobsService::new(Arc::new(tracker));
        let job_id = spawn_job(&service).await;

        // the response comes back before the helper has written anything
        let mut stream = tokio::time::timeout(
            Duration::from_secs(5),
            service.attach(attach_request(job_id, Channel::Stdout)),
        )
        .await
        .expect("attach waited for the job")
        .unwrap()
        .into_inner();

        let mut writer = helpers.link_stdout.lock().unwrap().take().unwrap();
        writer.write_all(b"early\n").await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.data, b"early\n");

        writer.write_all(b"late\n").await.unwrap();
        drop(writer);
        let rest: Vec<Chunk> = stream.try_collect().await.unwrap();
        let rest: Vec<u8> = rest.into_iter().flat_map(|chunk| chunk.data).collect();
        assert_eq!(rest, b"late\n");
    }

    #[test]
    fn splits_output_into_bounded_chunks() {
        let data = vec![7u8; CHUNK_SIZE * 2 + 1];
        let sizes: Vec<usize> = chunked(&data)
            .into_iter()
            .map(|chunk| chunk.unwrap().data.len())
            .collect();
        assert_eq!(sizes, vec![CHUNK_SIZE, CHUNK_SIZE, 1]);
        assert!(chunked(&[]).is_empty());
    }

    #[test]
    fn maps_job_errors_to_status_codes() {
        let code = |err| job_error_to_status(err).code();
        assert_eq!(
            code(JobError::LinkInvocation {
                job_id: 1,
                reason: LinkFailure::UnknownJob
            }),
            Code::NotFound
        );
        assert_eq!(
            code(JobError::LinkInvocation {
                job_id: 1,
                reason: LinkFailure::MissingWorkingDir("/gone".into())
            }),
            Code::FailedPrecondition
        );
        assert_eq!(
            code(JobError::ReadinessTimeout(Duration::from_secs(1))),
            Code::Unavailable
        );
        assert_eq!(
            code(JobError::SpawnLaunch(io::Error::new(io::ErrorKind::Other, "oh no!"))),
            Code::Internal
        );
    }

    #[tokio::test]
    async fn spawn_requires_a_command() {
        let root = tempfile::tempdir().unwrap();
        let status = service(root.path())
            .spawn(Request::new(SpawnRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn attach_to_unknown_job() {
        let root = tempfile::tempdir().unwrap();
        let request = AttachRequest {
            job_id: 9,
            channel: Channel::Stdout as i32,
        };
        let status = service(root.path())
            .attach(Request::new(request))
            .await
            .err()
            .expect("attach should fail");
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn link_to_unknown_job() {
        let root = tempfile::tempdir().unwrap();
        let status = Jobs::link(&service(root.path()), Request::new(LinkRequest { job_id: 3 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }
}
