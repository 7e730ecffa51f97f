pub mod remote;

pub use remote::RemotePlanner;
