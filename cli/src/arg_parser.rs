use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run commands on a job server and watch their output
#[derive(Debug, Parser)]
#[clap(name = "iomux")]
pub struct ArgParser {
    /// The address of the server
    #[clap(
        short = 's',
        long = "server",
        env = "IOMUX_SERVER",
        default_value = "http://127.0.0.1:7070"
    )]
    pub server: String,
    /// CA certificate to verify the server with (PEM); switches on TLS
    #[clap(long, parse(from_os_str))]
    pub ca_cert: Option<PathBuf>,
    /// Client certificate (PEM), for servers that require one
    #[clap(long, parse(from_os_str))]
    pub cert: Option<PathBuf>,
    /// Client private key (PEM)
    #[clap(long, parse(from_os_str))]
    pub key: Option<PathBuf>,
    /// Server name to expect in the server's certificate
    #[clap(long, default_value = "localhost")]
    pub domain: String,
    /// Log filter; logs go to stderr
    #[clap(long, env = "IOMUX_LOG")]
    pub log_level: Option<String>,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Subcommand)]
pub enum SubCommand {
    /// start a job and print its id
    Spawn {
        #[clap(long)]
        /// text fed to the job's standard input
        stdin: Option<String>,

        #[clap(required = true, last = true)]
        /// the command to run, followed by its args
        command: Vec<String>,
    },
    /// print a job's output so far and exit with its status (waits for the job to finish)
    Link {
        /// id printed by `spawn`
        job_id: u32,
    },
    /// start a job, stream its output and exit with its status
    Run {
        #[clap(long)]
        /// text fed to the job's standard input
        stdin: Option<String>,

        #[clap(required = true, last = true)]
        /// the command to run, followed by its args
        command: Vec<String>,
    },
}
