//! Discovery and validation of batch endpoints.
//!
//! Candidate endpoints are derived from the repository's configured
//! remotes, validated by a zero-object probe, and cached for the
//! lifetime of the repository instance.

use std::sync::Arc;

use lfs_api::models::{BatchRequest, Operation};
use lfs_api::{HttpClient, LfsClient};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::credentials::CredentialResolver;
use crate::repo::RemoteSpec;

/// Appended to a normalized remote URL to form a batch endpoint.
pub const BATCH_SUFFIX: &str = ".git/info/lfs/objects/batch";

/// A validated batch endpoint and its resolved authorization.
#[derive(Debug)]
pub struct Endpoint {
    pub url: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum DiscoverError {
    /// None of the configured remotes answered the probe.
    #[error("no working batch endpoint among {probed} probed candidates")]
    NoWorkingEndpoint { probed: usize },
}

/// Derives and validates the repository's batch endpoints.
pub struct RemoteRegistry<C: HttpClient> {
    client: Arc<LfsClient<C>>,
    credentials: CredentialResolver,
    remotes: Vec<RemoteSpec>,
    endpoints: OnceCell<Result<Arc<Vec<Arc<Endpoint>>>, DiscoverError>>,
}

impl<C: HttpClient> RemoteRegistry<C> {
    pub fn new(
        client: Arc<LfsClient<C>>,
        credentials: CredentialResolver,
        remotes: Vec<RemoteSpec>,
    ) -> Self {
        Self {
            client,
            credentials,
            remotes,
            endpoints: OnceCell::new(),
        }
    }

    /// The validated endpoint set, in remote-configuration order.
    ///
    /// Discovery runs on first use and the outcome, success or not,
    /// is cached for the lifetime of this registry.
    pub async fn endpoints(&self) -> Result<Arc<Vec<Arc<Endpoint>>>, DiscoverError> {
        self.endpoints
            .get_or_init(|| self.discover())
            .await
            .clone()
    }

    async fn discover(&self) -> Result<Arc<Vec<Arc<Endpoint>>>, DiscoverError> {
        let mut working: Vec<Arc<Endpoint>> = Vec::new();
        let mut probed = 0usize;

        for remote in &self.remotes {
            let Some(url) = candidate_url(&remote.url) else {
                debug!(remote = %remote.name, url = %remote.url, "skipping non-http remote");
                continue;
            };
            if working.iter().any(|endpoint| endpoint.url == url) {
                continue;
            }
            probed += 1;

            let authorization = self.credentials.authorization_for(&url);
            let probe = BatchRequest {
                operation: Operation::Download,
                transfers: None,
                reference: None,
                objects: Vec::new(),
                hash_algo: None,
            };

            match self
                .client
                .batch(&url, &probe, authorization.as_deref())
                .await
            {
                Ok(_) => {
                    debug!(%url, "batch endpoint validated");
                    working.push(Arc::new(Endpoint { url, authorization }));
                }
                Err(error) => {
                    warn!(%url, %error, "dropping batch endpoint candidate");
                }
            }
        }

        if working.is_empty() {
            Err(DiscoverError::NoWorkingEndpoint { probed })
        } else {
            Ok(Arc::new(working))
        }
    }
}

/// Normalize a configured remote URL into a batch endpoint candidate.
///
/// Strips a trailing slash and a trailing `.git`, then appends
/// [`BATCH_SUFFIX`]. Non-http(s) remotes yield no candidate; server
/// discovery over ssh is not supported.
#[must_use]
pub fn candidate_url(remote_url: &str) -> Option<String> {
    let url = remote_url.trim();
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return None;
    }
    let url = url.strip_suffix('/').unwrap_or(url);
    let url = url.strip_suffix(".git").unwrap_or(url);
    Some(format!("{url}{BATCH_SUFFIX}"))
}
