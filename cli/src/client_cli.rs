use crate::arg_parser::ArgParser;
use client::{GrpcHijacker, StreamHandler, StreamName};
use protobuf::{jobs_client::JobsClient, LinkRequest, LinkResponse, SpawnRequest};
use std::{error::Error, sync::Arc};
use tokio::io::AsyncWriteExt;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};
use tracing::{debug, warn};

type JobId = u32;

pub struct ClientCli {
    inner: JobsClient<Channel>,
}

impl ClientCli {
    pub async fn connect(args: &ArgParser) -> Result<Self, Box<dyn Error>> {
        let mut endpoint = Channel::from_shared(args.server.clone())?;
        if let Some(ca_cert) = &args.ca_cert {
            let mut tls = ClientTlsConfig::new()
                .domain_name(args.domain.clone())
                .ca_certificate(Certificate::from_pem(tokio::fs::read(ca_cert).await?));
            if let (Some(cert), Some(key)) = (&args.cert, &args.key) {
                let identity =
                    Identity::from_pem(tokio::fs::read(cert).await?, tokio::fs::read(key).await?);
                tls = tls.identity(identity);
            }
            endpoint = endpoint.tls_config(tls)?;
        }
        let channel = endpoint.connect().await?;
        debug!(server = %args.server, "connected");
        Ok(Self {
            inner: JobsClient::new(channel),
        })
    }

    pub async fn spawn(
        &mut self,
        command: &[String],
        stdin: Option<String>,
    ) -> Result<JobId, Box<dyn Error>> {
        let (path, args) = command.split_first().ok_or("missing command")?;
        let request = SpawnRequest {
            path: path.clone(),
            args: args.to_vec(),
            stdin: stdin.map(String::into_bytes).unwrap_or_default(),
        };
        let response = self.inner.spawn(request).await?;
        Ok(response.into_inner().job_id)
    }

    /// Write a job's output to our stdout/stderr and return its exit status.
    pub async fn link(&mut self, job_id: JobId) -> Result<u32, Box<dyn Error>> {
        let LinkResponse {
            exit_status,
            stdout,
            stderr,
        } = self.inner.link(LinkRequest { job_id }).await?.into_inner();

        let mut out = tokio::io::stdout();
        out.write_all(&stdout).await?;
        out.flush().await?;
        let mut err = tokio::io::stderr();
        err.write_all(&stderr).await?;
        err.flush().await?;
        Ok(exit_status)
    }

    /// Spawn a job, copy its output to ours and return its exit status.
    pub async fn run(
        &mut self,
        command: &[String],
        stdin: Option<String>,
    ) -> Result<u32, Box<dyn Error>> {
        let job_id = self.spawn(command, stdin).await?;
        debug!(job_id, "spawned, attaching");

        let hijacker = Arc::new(GrpcHijacker::new(self.inner.clone()));
        let handler = StreamHandler::new(job_id, hijacker.clone());
        // a stream we can't attach to is reported and skipped
        if let Err(err) = handler
            .stream_out(StreamName::Stdout, Some(tokio::io::stdout()))
            .await
        {
            warn!(job_id, %err, "no stdout for this run");
        }
        if let Err(err) = handler
            .stream_out(StreamName::Stderr, Some(tokio::io::stderr()))
            .await
        {
            warn!(job_id, %err, "no stderr for this run");
        }

        let completion = hijacker.completion(job_id).await?;
        Ok(handler.wait(completion).await?)
    }
}
