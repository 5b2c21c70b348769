//! Execute git commands against a directory tree of repositories on behalf
//! of remote callers.
//!
//! Requests arrive on a bounded queue (see [`Server::serve`]); each one runs
//! in its own task, streams the process stdio in bounded chunks and reports a
//! single [`protocol::ProcessResult`]. Repositories that an out-of-band clone
//! is still populating are gated through the [`cloning::CloneRegistry`].

pub mod cloning;
mod error;
mod exec;
pub mod metrics;
pub mod protocol;
pub mod remote;
pub mod server;
pub mod stream;

pub use error::{gitserver_error, GitserverError, GitserverResult};
pub use server::{Server, ServerConfig};
