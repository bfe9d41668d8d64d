use crate::errors::{JobError, LinkFailure, Result};
use crate::runner::{CommandRunner, CommandSpec, Output, ProcessHandle};
use crate::types::{Args, Dir, Input, JobId, LinkOutput, Program};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SPAWN_HELPER: &str = "iomux-spawn";
pub const LINK_HELPER: &str = "iomux-link";

/// The lines the spawn helper prints, in order, once the command is running.
const HANDSHAKE: [&str; 2] = ["ready", "active"];

struct Job {
    working_dir: Dir,
    /// Reaps the spawn helper once it exits.
    supervisor: JoinHandle<()>,
}

/// Launches jobs through the spawn helper and reads them back through the link helper.
///
/// The tracker keeps no output of its own: every `link` runs the link helper afresh, and the
/// helper is responsible for replaying a job's full history to any number of callers.
pub struct JobTracker {
    container_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    next_id: AtomicU32,
    jobs: Mutex<HashMap<JobId, Job>>,
    readiness_timeout: Option<Duration>,
}

impl JobTracker {
    pub fn new(container_root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            container_root: container_root.into(),
            runner,
            next_id: AtomicU32::new(1),
            jobs: Mutex::new(HashMap::new()),
            readiness_timeout: None,
        }
    }

    /// Give up on a spawn if the helper hasn't finished its handshake within `timeout`.
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    /// Start `program` as a new job and return its id once it is running.
    ///
    /// This waits for the spawn helper's handshake, never for the job itself to finish. If the
    /// handshake fails the helper is killed, so a failed spawn never leaves the command running.
    pub async fn spawn(&self, program: Program, args: Args, stdin: Option<Input>) -> Result<JobId> {
        let job_id = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| id.checked_add(1))
            .map_err(|_| JobError::IdsExhausted)?;
        let working_dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&working_dir)
            .await
            .map_err(|source| JobError::DirectoryCreation {
                path: working_dir.clone(),
                source,
            })?;

        let spec = CommandSpec::new(self.helper(SPAWN_HELPER))
            .arg(working_dir.to_string_lossy())
            .arg(program)
            .args(args)
            .stdin(stdin);
        debug!(job_id, ?spec, "launching spawn helper");
        let ProcessHandle {
            stdout,
            stderr,
            exit,
            kill,
        } = self.runner.start(spec).await.map_err(JobError::SpawnLaunch)?;
        let (hand_over, handed_over) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(job_id, handed_over, stderr, exit));

        let mut lines = BufReader::new(stdout).lines();
        let handshake = await_handshake(&mut lines);
        let ready = match self.readiness_timeout {
            Some(timeout) => tokio::time::timeout(timeout, handshake)
                .await
                .unwrap_or(Err(JobError::ReadinessTimeout(timeout))),
            None => handshake.await,
        };
        if let Err(err) = ready {
            warn!(job_id, %err, "spawn handshake failed, stopping the helper");
            let _ = kill.send(());
            return Err(err);
        }
        // the helper may keep writing, and must not be cut off mid-job
        let _ = hand_over.send(lines);

        self.lock_jobs().insert(
            job_id,
            Job {
                working_dir,
                supervisor,
            },
        );
        info!(job_id, "job active");
        Ok(job_id)
    }

    /// Run the link helper for `job_id` and collect everything it reports.
    ///
    /// Safe to call any number of times, concurrently, for the same job.
    pub async fn link(&self, job_id: JobId) -> Result<LinkOutput> {
        let ProcessHandle {
            mut stdout,
            mut stderr,
            exit,
            ..
        } = self.link_streams(job_id).await?;

        let collect = |err| JobError::link(job_id, LinkFailure::Collect(err));
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (out_read, err_read) = tokio::join!(
            stdout.read_to_end(&mut out),
            stderr.read_to_end(&mut err)
        );
        out_read.and(err_read).map_err(collect)?;
        let exit_status = exit.await.map_err(collect)?;

        debug!(job_id, exit_status, "link finished");
        Ok(LinkOutput {
            exit_status,
            stdout: out.into(),
            stderr: err.into(),
        })
    }

    /// Start the link helper for `job_id` and hand back its live output.
    ///
    /// Output can be read while the job is still running. The caller must drain both streams.
    pub async fn link_streams(&self, job_id: JobId) -> Result<ProcessHandle> {
        let working_dir = self
            .working_dir(job_id)
            .ok_or_else(|| JobError::link(job_id, LinkFailure::UnknownJob))?;
        let is_dir = tokio::fs::metadata(&working_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(JobError::link(
                job_id,
                LinkFailure::MissingWorkingDir(working_dir),
            ));
        }

        let spec = CommandSpec::new(self.helper(LINK_HELPER)).arg(working_dir.to_string_lossy());
        debug!(job_id, ?spec, "launching link helper");
        self.runner
            .start(spec)
            .await
            .map_err(|err| JobError::link(job_id, LinkFailure::Launch(err)))
    }

    pub fn working_dir(&self, job_id: JobId) -> Option<Dir> {
        self.lock_jobs()
            .get(&job_id)
            .map(|job| job.working_dir.clone())
    }

    /// Whether the spawn helper for `job_id` has exited. `None` for unknown jobs.
    pub fn helper_exited(&self, job_id: JobId) -> Option<bool> {
        self.lock_jobs()
            .get(&job_id)
            .map(|job| job.supervisor.is_finished())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.lock_jobs().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.container_root.join("jobs").join(job_id.to_string())
    }

    fn helper(&self, name: &str) -> PathBuf {
        self.container_root.join("bin").join(name)
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<JobId, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type HelperLines = Lines<BufReader<Output>>;

async fn await_handshake(lines: &mut HelperLines) -> Result<()> {
    for expected in HANDSHAKE {
        match lines.next_line().await.map_err(JobError::SpawnLaunch)? {
            Some(line) if line == expected => {}
            Some(got) => return Err(JobError::UnexpectedReadiness { expected, got }),
            None => return Err(JobError::SpawnExited { expected }),
        }
    }
    Ok(())
}

/// Drain the spawn helper's output and reap it.
///
/// Stdout arrives through `stdout` once the handshake has been read; it never arrives if the
/// handshake failed.
async fn supervise(
    job_id: JobId,
    stdout: oneshot::Receiver<HelperLines>,
    stderr: Output,
    exit: BoxFuture<'static, io::Result<u32>>,
) {
    let drain_stderr = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            warn!(job_id, %line, "spawn helper stderr");
        }
    };
    let drain_stdout = async {
        if let Ok(mut lines) = stdout.await {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(job_id, %line, "spawn helper stdout");
            }
        }
    };
    let ((), (), status) = tokio::join!(drain_stderr, drain_stdout, exit);
    match status {
        Ok(code) => debug!(job_id, code, "spawn helper exited"),
        Err(err) => warn!(job_id, %err, "lost track of spawn helper"),
    }
}
