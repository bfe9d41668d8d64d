mod arg_parser;
mod client_cli;

use arg_parser::{ArgParser, SubCommand};
use client_cli::ClientCli;

use clap::Parser;
use std::{error, process};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    let args = ArgParser::parse();
    init_logging(args.log_level.as_deref());
    let mut client = ClientCli::connect(&args).await?;

    match args.sub_command {
        SubCommand::Spawn { stdin, command } => {
            let job_id = client.spawn(&command, stdin).await?;
            println!("{}", job_id);
        }
        SubCommand::Link { job_id } => {
            let exit_status = client.link(job_id).await?;
            process::exit(exit_status as i32);
        }
        SubCommand::Run { stdin, command } => {
            let exit_status = client.run(&command, stdin).await?;
            process::exit(exit_status as i32);
        }
    }

    Ok(())
}

/// Quiet by default so job output isn't mixed with our own chatter.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
