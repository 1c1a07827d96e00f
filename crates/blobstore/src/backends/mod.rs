//! HTTP client backend implementations.

mod ureq_client;

pub use ureq_client::UreqClient;
