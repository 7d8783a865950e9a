//! Networked remote store backends for docsync.

mod http;

pub use http::HttpRemoteStore;
