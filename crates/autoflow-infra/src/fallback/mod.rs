//! Fallback agent clients.

pub mod remote;

pub use remote::RemoteFallbackAgent;
