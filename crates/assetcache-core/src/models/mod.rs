//! Request and response snapshots exchanged between the lifecycle
//! manager, the cache storage and the network.
//!
//! Both types are plain owned data: a `Response` body is a reference
//! counted `Bytes`, so cloning one to store it while handing the original
//! back to the caller does not copy the payload.

pub mod request;
pub mod response;

pub use request::Request;
pub use response::{Response, ResponseType};
