use clap::Parser;
use std::{io, net::SocketAddr, path::PathBuf, time::Duration};
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

/// Serve container jobs over gRPC
#[derive(Debug, Parser)]
#[clap(name = "iomuxd")]
pub struct Config {
    /// Address to listen on
    #[clap(long, env = "IOMUX_LISTEN", default_value = "127.0.0.1:7070")]
    pub listen: SocketAddr,

    /// Container root holding `bin/iomux-spawn`, `bin/iomux-link` and the `jobs/` tree
    #[clap(long, env = "IOMUX_CONTAINER_ROOT", parse(from_os_str))]
    pub container_root: PathBuf,

    /// Fail a spawn if the helper isn't ready within this many milliseconds
    #[clap(long, env = "IOMUX_READINESS_TIMEOUT_MS")]
    pub readiness_timeout_ms: Option<u64>,

    /// Server certificate (PEM); enables mutual TLS together with --tls-key and --tls-ca
    #[clap(long, parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// Server private key (PEM)
    #[clap(long, parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// CA that client certificates must chain to (PEM)
    #[clap(long, parse(from_os_str))]
    pub tls_ca: Option<PathBuf>,

    /// Log filter, e.g. "info" or "joblib=debug"; falls back to RUST_LOG
    #[clap(long, env = "IOMUX_LOG")]
    pub log_level: Option<String>,
}

impl Config {
    pub fn readiness_timeout(&self) -> Option<Duration> {
        self.readiness_timeout_ms.map(Duration::from_millis)
    }

    /// Load the TLS material, if any was configured.
    pub async fn tls(&self) -> io::Result<Option<ServerTlsConfig>> {
        match (&self.tls_cert, &self.tls_key, &self.tls_ca) {
            (None, None, None) => Ok(None),
            (Some(cert), Some(key), Some(ca)) => {
                let identity = Identity::from_pem(tokio::fs::read(cert).await?, tokio::fs::read(key).await?);
                let ca = Certificate::from_pem(tokio::fs::read(ca).await?);
                Ok(Some(
                    ServerTlsConfig::new()
                        .identity(identity)
                        .client_ca_root(ca),
                ))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "--tls-cert, --tls-key and --tls-ca must be given together",
            )),
        }
    }
}
