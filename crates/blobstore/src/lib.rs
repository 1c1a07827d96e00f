//! Blocking object-store client SDK for blobfs.
//!
//! The worker threads of the cache core each own one client handle for
//! their lifetime, so everything here is blocking: requests run on the
//! calling thread against a reusable HTTP agent. Authentication and
//! request signing are the embedding application's concern; it supplies
//! any required headers at construction time.

mod backends;
mod error;
mod http_client;
mod store;

pub use backends::UreqClient;
pub use error::{HttpClientError, StoreError};
pub use http_client::{HttpClient, HttpRequest, HttpResponse};
pub use store::{BlobStore, PartEtag};
