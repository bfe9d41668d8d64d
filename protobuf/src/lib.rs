//! Wire types shared by the server and its clients.

pub mod completion;

pub use completion::CompletionMessage;

tonic::include_proto!("iomux");
