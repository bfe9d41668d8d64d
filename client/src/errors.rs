use crate::hijack::StreamName;
use std::{io, result};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("attach to stream {stream}: {source}")]
    Attach { stream: StreamName, source: io::Error },
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("process error: {0}")]
    Process(String),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad completion record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control channel closed before the process finished")]
    UnexpectedEof,
}

pub type Result<T> = result::Result<T, StreamError>;
