//! Rust client for the git-lfs batch API.

mod backends;
mod client;
pub mod error;
mod http_client;
pub mod models;

pub use backends::ReqwestClient;
pub use client::{LfsClient, MEDIA_TYPE};
pub use error::{BatchError, BatchStatus, HttpClientError, TransferError};
pub use http_client::{HttpClient, HttpRequest, HttpResponse};
