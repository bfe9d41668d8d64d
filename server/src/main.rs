mod config;
mod logging;
mod services;

use clap::Parser;
use config::Config;
use joblib::{JobTracker, ProcessRunner};
use protobuf::jobs_server::JobsServer;
use services::jobservice::JobsService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Server, ServerTlsConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    logging::init(config.log_level.as_deref());

    let tls = config.tls().await?;
    let mut tracker = JobTracker::new(&config.container_root, Arc::new(ProcessRunner));
    if let Some(timeout) = config.readiness_timeout() {
        tracker = tracker.with_readiness_timeout(timeout);
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        addr = %config.listen,
        container_root = %config.container_root.display(),
        tls = tls.is_some(),
        "listening"
    );
    serve(JobsService::new(Arc::new(tracker)), tls, listener).await?;
    Ok(())
}

async fn serve(
    service: JobsService,
    tls: Option<ServerTlsConfig>,
    listener: TcpListener,
) -> Result<(), tonic::transport::Error> {
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder.tls_config(tls)?;
    }
    builder
        .add_service(JobsServer::new(service))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
}
