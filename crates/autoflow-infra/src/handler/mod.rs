//! Step handlers backed by infrastructure clients.

pub mod http;

pub use http::HttpRequestHandler;
