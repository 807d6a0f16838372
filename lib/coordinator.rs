//! Background pump that coalesces access-URL requests into batched
//! protocol calls.
//!
//! Readers enqueue objects needing a fresh URL; a single lazily
//! spawned worker drains the queue in rounds, one batch call per
//! round, grouping objects so a mixed-endpoint queue needs as few
//! calls as possible. Waiters are parked on the round, not on the
//! network call, so the state lock is never held across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use lfs_api::error::{BatchError, TransferError};
use lfs_api::models::{BatchRequest, BatchResponse, Operation, RequestObject, ResponseObject};
use lfs_api::{HttpClient, LfsClient};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::object::{AccessUrl, ObjectFailure, RemoteLargeFile, RemoteSource};
use crate::remotes::{DiscoverError, Endpoint, RemoteRegistry};

/// Completion future for one drain pass. Waiters re-check their
/// object's state once the round completes and re-enqueue if it has
/// not been served yet.
struct Round {
    completed: AtomicBool,
    notify: Notify,
}

impl Round {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.completed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

struct PumpState {
    pending: Vec<Arc<RemoteLargeFile>>,
    /// The round the next worker pass will complete. Swapped for a
    /// fresh one at snapshot time, so callers arriving after the
    /// network call has started join the next round.
    round: Arc<Round>,
    worker_active: bool,
}

/// Coalesces concurrent resolution requests into minimal batch calls.
pub struct FetchCoordinator<C: HttpClient> {
    state: Mutex<PumpState>,
    client: Arc<LfsClient<C>>,
    registry: Arc<RemoteRegistry<C>>,
    self_ref: Weak<Self>,
}

impl<C: HttpClient + 'static> FetchCoordinator<C> {
    pub fn new(client: Arc<LfsClient<C>>, registry: Arc<RemoteRegistry<C>>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(PumpState {
                pending: Vec::new(),
                round: Round::new(),
                worker_active: false,
            }),
            client,
            registry,
            self_ref: self_ref.clone(),
        })
    }

    /// Add an object to the pending set and return the round that
    /// will cover it. Starts the worker if none is draining.
    fn enqueue(&self, object: Arc<RemoteLargeFile>) -> Arc<Round> {
        let mut state = self.state.lock();

        let oid = &object.pointer().oid;
        if !state
            .pending
            .iter()
            .any(|pending| &pending.pointer().oid == oid)
        {
            state.pending.push(object);
        }

        let round = Arc::clone(&state.round);
        if !state.worker_active {
            state.worker_active = true;
            let this = self
                .self_ref
                .upgrade()
                .unwrap_or_else(|| unreachable!("coordinator is alive while enqueuing"));
            tokio::spawn(async move { this.run_worker().await });
        }
        round
    }

    /// Drain passes until the pending set is empty. One worker runs
    /// at a time; the next enqueue respawns it.
    async fn run_worker(self: Arc<Self>) {
        loop {
            let (snapshot, round) = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    state.worker_active = false;
                    return;
                }
                let snapshot = std::mem::take(&mut state.pending);
                let round = std::mem::replace(&mut state.round, Round::new());
                (snapshot, round)
            };

            self.drain_pass(snapshot).await;
            round.complete();
        }
    }

    /// One round: group the snapshot, issue a single batch call for
    /// the largest group, distribute results. Objects outside the
    /// chosen group go back to the pending set without blocking the
    /// round.
    async fn drain_pass(&self, snapshot: Vec<Arc<RemoteLargeFile>>) {
        let endpoints = match self.registry.endpoints().await {
            Ok(endpoints) => endpoints,
            Err(DiscoverError::NoWorkingEndpoint { .. }) => {
                warn!(
                    objects = snapshot.len(),
                    "no working batch endpoint; failing pending objects"
                );
                for object in &snapshot {
                    object.fail(ObjectFailure::NoEndpoint);
                }
                return;
            }
        };

        let mut live = Vec::new();
        for object in snapshot {
            object.init_candidates(&endpoints);
            if object.failure().is_some() || object.has_fresh_access() {
                continue;
            }
            if object.candidates().is_empty() {
                object.fail_exhausted();
                continue;
            }
            live.push(object);
        }

        let Some((group_endpoint, hash_algo, chosen)) = choose_group(&live) else {
            return;
        };

        // Everything outside the chosen group waits for the next pass.
        let chosen_oids: Vec<&str> = chosen
            .iter()
            .map(|object| object.pointer().oid.as_str())
            .collect();
        let deferred: Vec<Arc<RemoteLargeFile>> = live
            .iter()
            .filter(|object| !chosen_oids.contains(&object.pointer().oid.as_str()))
            .cloned()
            .collect();
        self.requeue(deferred);

        let request = BatchRequest {
            operation: Operation::Download,
            transfers: Some(vec!["basic".to_owned()]),
            reference: None,
            objects: chosen
                .iter()
                .map(|object| RequestObject {
                    oid: object.pointer().oid.clone(),
                    size: object.pointer().size,
                })
                .collect(),
            hash_algo: Some(hash_algo),
        };

        debug!(
            endpoint = %group_endpoint.url,
            objects = chosen.len(),
            "issuing batch call"
        );

        match self
            .client
            .batch(
                &group_endpoint.url,
                &request,
                group_endpoint.authorization.as_deref(),
            )
            .await
        {
            Ok(response) => self.distribute(&group_endpoint, chosen, response),
            Err(error @ (BatchError::Server(_) | BatchError::Protocol(_) | BatchError::Json(_))) => {
                // The exchange itself was malformed; these objects are
                // done, whatever other endpoints they may have had.
                warn!(endpoint = %group_endpoint.url, %error, "batch exchange malformed");
                for object in &chosen {
                    object.fail(ObjectFailure::Protocol(error.to_string()));
                }
            }
            Err(error) => {
                // Status or transport failure: scoped to this endpoint,
                // the objects may still succeed on another candidate.
                warn!(endpoint = %group_endpoint.url, %error, "batch call failed");
                let message = error.to_string();
                let mut requeue = Vec::new();
                for object in &chosen {
                    self.record_endpoint_error(object, &group_endpoint.url, &message, &mut requeue);
                }
                self.requeue(requeue);
            }
        }
    }

    /// Apply one batch response to the objects it was issued for.
    fn distribute(
        &self,
        endpoint: &Arc<Endpoint>,
        chosen: Vec<Arc<RemoteLargeFile>>,
        response: BatchResponse,
    ) {
        let by_oid: HashMap<&str, &ResponseObject> = response
            .objects
            .iter()
            .map(|object| (object.oid.as_str(), object))
            .collect();

        let mut requeue = Vec::new();
        for object in &chosen {
            let oid = object.pointer().oid.as_str();
            match by_oid.get(oid) {
                Some(result) => {
                    if let Some(error) = &result.error {
                        debug!(%oid, endpoint = %endpoint.url, %error, "object rejected by endpoint");
                        self.record_endpoint_error(
                            object,
                            &endpoint.url,
                            &error.to_string(),
                            &mut requeue,
                        );
                        continue;
                    }
                    match result.actions.as_ref().and_then(|a| a.download.as_ref()) {
                        Some(download) => {
                            object.set_access(AccessUrl {
                                href: download.href.clone(),
                                headers: download.header.clone(),
                                expires_at: download
                                    .expires_at
                                    .as_ref()
                                    .and_then(lfs_api::models::ExpiresAt::to_utc),
                            });
                        }
                        None => self.record_endpoint_error(
                            object,
                            &endpoint.url,
                            "response object carries no download action",
                            &mut requeue,
                        ),
                    }
                }
                None => self.record_endpoint_error(
                    object,
                    &endpoint.url,
                    "requested oid missing from response",
                    &mut requeue,
                ),
            }
        }
        self.requeue(requeue);
    }

    /// Drop an endpoint for one object; requeue it while candidates
    /// remain, otherwise fail it for good.
    fn record_endpoint_error(
        &self,
        object: &Arc<RemoteLargeFile>,
        endpoint_url: &str,
        error: &str,
        requeue: &mut Vec<Arc<RemoteLargeFile>>,
    ) {
        let remaining = object.remove_candidate(endpoint_url, error.to_owned());
        if remaining == 0 {
            object.fail_exhausted();
        } else {
            requeue.push(Arc::clone(object));
        }
    }

    fn requeue(&self, objects: Vec<Arc<RemoteLargeFile>>) {
        if objects.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        for object in objects {
            let oid = &object.pointer().oid;
            if !state
                .pending
                .iter()
                .any(|pending| &pending.pointer().oid == oid)
            {
                state.pending.push(object);
            }
        }
    }
}

#[async_trait]
impl<C: HttpClient + 'static> RemoteSource for FetchCoordinator<C> {
    async fn request_resolution(&self, object: Arc<RemoteLargeFile>) {
        let round = self.enqueue(object);
        round.wait().await;
    }

    async fn read_range(
        &self,
        access: &AccessUrl,
        offset: u64,
        len: u32,
    ) -> Result<Bytes, TransferError> {
        self.client
            .get_range(&access.href, &access.headers, offset, len)
            .await
    }
}

/// Pick the `(endpoint, hash_algo)` group with the most members.
///
/// Each object contributes to one group per endpoint still in its
/// candidate set. Ties break by lexicographic `(endpoint url,
/// hash_algo)`, smallest first, so draining order is deterministic.
fn choose_group(
    objects: &[Arc<RemoteLargeFile>],
) -> Option<(Arc<Endpoint>, String, Vec<Arc<RemoteLargeFile>>)> {
    let mut groups: HashMap<(String, String), (Arc<Endpoint>, Vec<Arc<RemoteLargeFile>>)> =
        HashMap::new();

    for object in objects {
        let algo = object.pointer().hash_algo.clone();
        for endpoint in object.candidates() {
            let key = (endpoint.url.clone(), algo.clone());
            groups
                .entry(key)
                .or_insert_with(|| (endpoint, Vec::new()))
                .1
                .push(Arc::clone(object));
        }
    }

    groups
        .into_iter()
        .max_by(|((url_a, algo_a), (_, members_a)), ((url_b, algo_b), (_, members_b))| {
            members_a
                .len()
                .cmp(&members_b.len())
                .then_with(|| url_b.cmp(url_a))
                .then_with(|| algo_b.cmp(algo_a))
        })
        .map(|((_, algo), (endpoint, members))| (endpoint, algo, members))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::Pointer;
    use std::path::Path;

    /// Resolution never runs in these tests; only candidate state does.
    struct InertSource;

    #[async_trait]
    impl RemoteSource for InertSource {
        async fn request_resolution(&self, _object: Arc<RemoteLargeFile>) {
            unreachable!("grouping tests never resolve");
        }

        async fn read_range(
            &self,
            _access: &AccessUrl,
            _offset: u64,
            _len: u32,
        ) -> Result<Bytes, TransferError> {
            unreachable!("grouping tests never read");
        }
    }

    fn endpoint(url: &str) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            url: url.to_owned(),
            authorization: None,
        })
    }

    fn object_with_candidates(oid: &str, endpoints: &[Arc<Endpoint>]) -> Arc<RemoteLargeFile> {
        let object = RemoteLargeFile::new(
            Pointer {
                hash_algo: "sha256".to_owned(),
                oid: oid.to_owned(),
                size: 1,
            },
            Path::new("/tmp/ctl"),
            Arc::new(InertSource),
        );
        object.init_candidates(endpoints);
        object
    }

    #[test]
    fn largest_group_wins() {
        let a = endpoint("https://a.example.com/batch");
        let b = endpoint("https://b.example.com/batch");

        let mut objects = Vec::new();
        for oid in ["o1", "o2", "o3"] {
            objects.push(object_with_candidates(oid, std::slice::from_ref(&a)));
        }
        for oid in ["o4", "o5", "o6", "o7", "o8"] {
            objects.push(object_with_candidates(oid, std::slice::from_ref(&b)));
        }
        for oid in ["o9", "o10"] {
            objects.push(object_with_candidates(oid, std::slice::from_ref(&a)));
        }

        let (chosen_endpoint, _, members) = choose_group(&objects).unwrap();
        assert_eq!(chosen_endpoint.url, b.url);
        assert_eq!(members.len(), 5);
    }

    #[test]
    fn ties_break_by_endpoint_url() {
        let a = endpoint("https://a.example.com/batch");
        let b = endpoint("https://b.example.com/batch");

        let objects = vec![
            object_with_candidates("o1", std::slice::from_ref(&b)),
            object_with_candidates("o2", std::slice::from_ref(&a)),
        ];

        let (chosen_endpoint, _, _) = choose_group(&objects).unwrap();
        assert_eq!(chosen_endpoint.url, a.url);
    }

    #[test]
    fn objects_span_every_candidate_endpoint() {
        let a = endpoint("https://a.example.com/batch");
        let b = endpoint("https://b.example.com/batch");
        let both = vec![Arc::clone(&a), Arc::clone(&b)];

        let objects = vec![
            object_with_candidates("o1", &both),
            object_with_candidates("o2", std::slice::from_ref(&a)),
        ];

        // Group A holds both objects, group B only the first.
        let (chosen_endpoint, _, members) = choose_group(&objects).unwrap();
        assert_eq!(chosen_endpoint.url, a.url);
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn empty_input_yields_no_group() {
        assert!(choose_group(&[]).is_none());
    }
}
