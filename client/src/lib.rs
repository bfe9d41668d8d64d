//! Client side of the attach protocol: hook a process's channels up to local readers and
//! writers, then wait for it to finish without losing any in-flight output.

pub mod completion;
pub mod errors;
pub mod grpc;
pub mod hijack;
mod stream_handler;

pub use grpc::GrpcHijacker;
pub use hijack::{Hijack, Hijacked, StreamId, StreamName};
pub use stream_handler::StreamHandler;
