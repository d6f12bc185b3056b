//! Channel nodes
//!
//! User-space stand-in for character device nodes: every channel is a Unix
//! socket under the node directory, served on the Tokio runtime.

pub mod server;
pub mod socket;

pub use server::{NodeServer, serve_session};
pub use socket::{NodeEvent, SocketNodes};
