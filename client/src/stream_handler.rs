use crate::completion::{Completion, CompletionDecoder};
use crate::errors::{Result, StreamError};
use crate::hijack::{Hijack, Hijacked, StreamId, StreamName};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error};

/// Attaches local readers and writers to the channels of one remote process.
///
/// Output copies run as background tasks. `wait` only returns once every one of them has
/// finished, so a caller never sees the process as done while its output is still arriving.
pub struct StreamHandler<H> {
    stream_id: StreamId,
    hijacker: Arc<H>,
    in_flight: InFlight,
}

impl<H: Hijack> StreamHandler<H> {
    pub fn new(stream_id: StreamId, hijacker: Arc<H>) -> Self {
        Self {
            stream_id,
            hijacker,
            in_flight: InFlight::new(),
        }
    }

    /// Copy `input` into the process's stdin, then close it.
    ///
    /// Best effort: failures are logged and never reach the completion result.
    pub fn stream_in<R>(&self, input: Option<R>)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut input = match input {
            Some(input) => input,
            None => return,
        };
        let hijacker = self.hijacker.clone();
        let stream_id = self.stream_id;
        tokio::spawn(async move {
            match copy_input(&*hijacker, stream_id, &mut input).await {
                Ok(bytes) => debug!(stream_id, bytes, "stdin delivered"),
                Err(err) => error!(stream_id, %err, "streaming stdin payload failed"),
            }
        });
    }

    /// Attach to the process's `stream` and copy it into `sink` in the background.
    ///
    /// A failed attach only affects this one stream.
    pub async fn stream_out<W>(&self, stream: StreamName, sink: Option<W>) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut sink = match sink {
            Some(sink) => sink,
            None => return Ok(()),
        };
        let Hijacked { conn, mut source } = self
            .hijacker
            .hijack(self.stream_id, stream)
            .await
            .map_err(|source| {
                error!(stream_id = self.stream_id, %stream, %source, "attach to stream failed");
                StreamError::Attach { stream, source }
            })?;

        let guard = self.in_flight.enter();
        let stream_id = self.stream_id;
        tokio::spawn(async move {
            // the hijacked connection has to outlive the copy
            let _conn = conn;
            match tokio::io::copy(&mut source, &mut sink).await {
                Ok(bytes) => debug!(stream_id, %stream, bytes, "stream drained"),
                Err(err) => debug!(stream_id, %stream, %err, "stream copy ended early"),
            }
            let _ = sink.flush().await;
            drop(guard);
        });
        Ok(())
    }

    /// Read the control channel until the process's exit status (or error) arrives, then
    /// wait for all output copies to finish.
    pub async fn wait<R>(&self, completion: R) -> Result<u32>
    where
        R: AsyncBufRead + Unpin,
    {
        let outcome = CompletionDecoder::new(completion).completion().await;
        self.in_flight.wait_idle().await;
        match outcome? {
            Completion::Exited(status) => Ok(status),
            Completion::Failed(text) => Err(StreamError::Process(text)),
        }
    }
}

async fn copy_input<H, R>(hijacker: &H, stream_id: StreamId, input: &mut R) -> io::Result<u64>
where
    H: Hijack,
    R: AsyncRead + Unpin,
{
    let Hijacked { mut conn, .. } = hijacker.hijack(stream_id, StreamName::Stdin).await?;
    let bytes = tokio::io::copy(input, &mut conn).await?;
    conn.shutdown().await?;
    Ok(bytes)
}

/// Number of output copies still running.
struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    fn enter(&self) -> InFlightGuard {
        self.count.send_modify(|count| *count += 1);
        InFlightGuard {
            count: self.count.clone(),
        }
    }

    async fn wait_idle(&self) {
        let mut count = self.count.subscribe();
        while *count.borrow_and_update() != 0 {
            if count.changed().await.is_err() {
                return;
            }
        }
    }
}

struct InFlightGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DecodeError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Hands out pre-built channels, each at most once.
    #[derive(Default)]
    struct FakeHijacker {
        channels: Mutex<HashMap<StreamName, Hijacked>>,
    }

    impl FakeHijacker {
        fn with(self, stream: StreamName, hijacked: Hijacked) -> Self {
            self.channels.lock().unwrap().insert(stream, hijacked);
            self
        }

        fn has(&self, stream: StreamName) -> bool {
            self.channels.lock().unwrap().contains_key(&stream)
        }
    }

    #[async_trait]
    impl Hijack for FakeHijacker {
        async fn hijack(&self, _: StreamId, stream: StreamName) -> io::Result<Hijacked> {
            self.channels.lock().unwrap().remove(&stream).ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
            })
        }
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// An output channel that produces `data` only after `delay`.
    fn output(data: &'static [u8], delay: Duration) -> Hijacked {
        let (mut tx, rx) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.write_all(data).await;
        });
        Hijacked {
            conn: Box::new(tokio::io::sink()),
            source: Box::new(rx),
        }
    }

    /// An input channel plus the far end the test reads from.
    fn input() -> (Hijacked, DuplexStream) {
        let (conn, far_end) = tokio::io::duplex(1024);
        let hijacked = Hijacked {
            conn: Box::new(conn),
            source: Box::new(tokio::io::empty()),
        };
        (hijacked, far_end)
    }

    const EXITED_0: &[u8] = b"{\"exitStatus\":0}\n";

    #[tokio::test]
    async fn wait_returns_only_after_output_is_flushed() {
        let delay = Duration::from_millis(200);
        let hijacker = FakeHijacker::default().with(StreamName::Stdout, output(b"late bytes", delay));
        let handler = StreamHandler::new(1, Arc::new(hijacker));
        let stdout = SharedBuf::default();

        let started = Instant::now();
        handler
            .stream_out(StreamName::Stdout, Some(stdout.clone()))
            .await
            .unwrap();
        let status = handler.wait(EXITED_0).await.unwrap();

        assert_eq!(status, 0);
        assert!(started.elapsed() >= delay);
        assert_eq!(stdout.contents(), b"late bytes");
    }

    #[tokio::test]
    async fn copies_stdout_and_stderr_separately() {
        let hijacker = FakeHijacker::default()
            .with(StreamName::Stdout, output(b"hi out\n", Duration::ZERO))
            .with(StreamName::Stderr, output(b"hi err\n", Duration::from_millis(50)));
        let handler = StreamHandler::new(7, Arc::new(hijacker));
        let (stdout, stderr) = (SharedBuf::default(), SharedBuf::default());

        handler
            .stream_out(StreamName::Stdout, Some(stdout.clone()))
            .await
            .unwrap();
        handler
            .stream_out(StreamName::Stderr, Some(stderr.clone()))
            .await
            .unwrap();
        let status = handler
            .wait(&b"{}\n{\"exitStatus\":42}\n"[..])
            .await
            .unwrap();

        assert_eq!(status, 42);
        assert_eq!(stdout.contents(), b"hi out\n");
        assert_eq!(stderr.contents(), b"hi err\n");
    }

    #[tokio::test]
    async fn process_error_still_waits_for_output() {
        let delay = Duration::from_millis(100);
        let hijacker = FakeHijacker::default().with(StreamName::Stdout, output(b"partial", delay));
        let handler = StreamHandler::new(1, Arc::new(hijacker));
        let stdout = SharedBuf::default();
        handler
            .stream_out(StreamName::Stdout, Some(stdout.clone()))
            .await
            .unwrap();

        let started = Instant::now();
        let err = handler
            .wait(&b"{\"errorText\":\"boom\"}\n"[..])
            .await
            .unwrap_err();

        assert!(matches!(err, StreamError::Process(ref text) if text == "boom"));
        assert!(started.elapsed() >= delay);
        assert_eq!(stdout.contents(), b"partial");
    }

    #[tokio::test]
    async fn decode_failure_is_the_result() {
        let handler = StreamHandler::new(1, Arc::new(FakeHijacker::default()));
        let err = handler.wait(&b"garbage\n"[..]).await.unwrap_err();
        assert!(matches!(err, StreamError::Decode(DecodeError::Json(_))));

        let err = handler.wait(&b""[..]).await.unwrap_err();
        assert!(matches!(err, StreamError::Decode(DecodeError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn attach_failure_only_affects_its_stream() {
        let hijacker = FakeHijacker::default().with(StreamName::Stdout, output(b"fine", Duration::ZERO));
        let handler = StreamHandler::new(3, Arc::new(hijacker));
        let stdout = SharedBuf::default();

        let err = handler
            .stream_out(StreamName::Stderr, Some(SharedBuf::default()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::Attach {
                stream: StreamName::Stderr,
                ..
            }
        ));
        assert!(err.to_string().starts_with("attach to stream stderr: "));

        handler
            .stream_out(StreamName::Stdout, Some(stdout.clone()))
            .await
            .unwrap();
        assert_eq!(handler.wait(EXITED_0).await.unwrap(), 0);
        assert_eq!(stdout.contents(), b"fine");
    }

    #[tokio::test]
    async fn absent_sinks_and_input_do_nothing() {
        let (stdin, _far_end) = input();
        let hijacker = Arc::new(
            FakeHijacker::default()
                .with(StreamName::Stdin, stdin)
                .with(StreamName::Stdout, output(b"", Duration::ZERO)),
        );
        let handler = StreamHandler::new(1, hijacker.clone());

        handler.stream_in(None::<&'static [u8]>);
        handler
            .stream_out(StreamName::Stdout, None::<SharedBuf>)
            .await
            .unwrap();

        assert_eq!(handler.wait(EXITED_0).await.unwrap(), 0);
        assert!(hijacker.has(StreamName::Stdin));
        assert!(hijacker.has(StreamName::Stdout));
    }

    #[tokio::test]
    async fn streams_input_then_closes_it() {
        let (stdin, mut far_end) = input();
        let hijacker = FakeHijacker::default().with(StreamName::Stdin, stdin);
        let handler = StreamHandler::new(1, Arc::new(hijacker));

        handler.stream_in(Some(&b"echo hi"[..]));

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), far_end.read_to_end(&mut received))
            .await
            .expect("stdin was never closed")
            .unwrap();
        assert_eq!(received, b"echo hi");
    }

    #[tokio::test]
    async fn input_failures_are_not_reported() {
        let handler = StreamHandler::new(1, Arc::new(FakeHijacker::default()));
        handler.stream_in(Some(&b"lost"[..]));
        assert_eq!(
            handler.wait(&b"{\"exitStatus\":7}\n"[..]).await.unwrap(),
            7
        );
    }
}
