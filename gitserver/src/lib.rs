//! HTTP front end for [`gitserver_core`].

pub mod cli;
pub mod frame;
pub mod http;
