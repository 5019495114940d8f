//! Batch Dispatch
//!
//! Fans a batch of requests out to per-element tasks on the owner's runtime and
//! reports each outcome through the completion callback. This is the only place
//! where a store [`Error`] becomes a response [`Status`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::owner::RequestOwner;
use super::{
    ChunkData, GetChunkRequest, GetChunkResponse, GetRequest, GetResponse, GetValueRequest,
    GetValueResponse, PutRequest, PutResponse, PutValueRequest, PutValueResponse, Status,
};
use crate::cache::CacheKey;
use crate::error::{Error, Result};
use crate::store::CacheStore;

type Callback<R> = Arc<dyn Fn(R) + Send + Sync>;

/// Batched request API over any [`CacheStore`].
///
/// Callbacks fire exactly once per request, on arbitrary worker threads and
/// in no particular order. The collecting `*_all` forms return the responses
/// once every element of the batch has completed.
#[async_trait]
pub trait CacheStoreExt {
    fn put<F>(&self, requests: Vec<PutRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(PutResponse) + Send + Sync + 'static;

    fn get<F>(&self, requests: Vec<GetRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(GetResponse) + Send + Sync + 'static;

    fn put_values<F>(&self, requests: Vec<PutValueRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(PutValueResponse) + Send + Sync + 'static;

    fn get_values<F>(&self, requests: Vec<GetValueRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(GetValueResponse) + Send + Sync + 'static;

    fn get_chunks<F>(&self, requests: Vec<GetChunkRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(GetChunkResponse) + Send + Sync + 'static;

    async fn put_all(&self, requests: Vec<PutRequest>, owner: &RequestOwner) -> Vec<PutResponse>;

    async fn get_all(&self, requests: Vec<GetRequest>, owner: &RequestOwner) -> Vec<GetResponse>;

    async fn put_values_all(
        &self,
        requests: Vec<PutValueRequest>,
        owner: &RequestOwner,
    ) -> Vec<PutValueResponse>;

    async fn get_values_all(
        &self,
        requests: Vec<GetValueRequest>,
        owner: &RequestOwner,
    ) -> Vec<GetValueResponse>;

    async fn get_chunks_all(
        &self,
        requests: Vec<GetChunkRequest>,
        owner: &RequestOwner,
    ) -> Vec<GetChunkResponse>;
}

#[async_trait]
impl<S> CacheStoreExt for Arc<S>
where
    S: CacheStore + ?Sized + 'static,
{
    fn put<F>(&self, requests: Vec<PutRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(PutResponse) + Send + Sync + 'static,
    {
        let store = self.clone();
        submit(
            owner,
            requests,
            Arc::new(on_complete),
            move |request: PutRequest| {
                let store = store.clone();
                async move {
                    let result = store.put_record(&request.record, &request.policy).await;
                    let key = request.record.key().clone();
                    let (_, status) = settle(store.name(), "put", &request.name, &key, result);
                    PutResponse {
                        name: request.name,
                        key,
                        status,
                        user_data: request.user_data,
                    }
                }
            },
            |request| PutResponse {
                key: request.record.key().clone(),
                name: request.name,
                status: Status::Canceled,
                user_data: request.user_data,
            },
        );
    }

    fn get<F>(&self, requests: Vec<GetRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(GetResponse) + Send + Sync + 'static,
    {
        let store = self.clone();
        submit(
            owner,
            requests,
            Arc::new(on_complete),
            move |request: GetRequest| {
                let store = store.clone();
                async move {
                    let result = store.get_record(&request.key, &request.policy).await;
                    let (record, status) =
                        settle(store.name(), "get", &request.name, &request.key, result);
                    GetResponse {
                        name: request.name,
                        key: request.key,
                        record,
                        status,
                        user_data: request.user_data,
                    }
                }
            },
            |request| GetResponse {
                name: request.name,
                key: request.key,
                record: None,
                status: Status::Canceled,
                user_data: request.user_data,
            },
        );
    }

    fn put_values<F>(&self, requests: Vec<PutValueRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(PutValueResponse) + Send + Sync + 'static,
    {
        let store = self.clone();
        submit(
            owner,
            requests,
            Arc::new(on_complete),
            move |request: PutValueRequest| {
                let store = store.clone();
                async move {
                    let result = store
                        .put_value(&request.key, &request.value, request.policy)
                        .await;
                    let (_, status) =
                        settle(store.name(), "put_value", &request.name, &request.key, result);
                    PutValueResponse {
                        name: request.name,
                        key: request.key,
                        status,
                        user_data: request.user_data,
                    }
                }
            },
            |request| PutValueResponse {
                name: request.name,
                key: request.key,
                status: Status::Canceled,
                user_data: request.user_data,
            },
        );
    }

    fn get_values<F>(&self, requests: Vec<GetValueRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(GetValueResponse) + Send + Sync + 'static,
    {
        let store = self.clone();
        submit(
            owner,
            requests,
            Arc::new(on_complete),
            move |request: GetValueRequest| {
                let store = store.clone();
                async move {
                    let result = store.get_value(&request.key, request.policy).await;
                    let (value, status) =
                        settle(store.name(), "get_value", &request.name, &request.key, result);
                    GetValueResponse {
                        name: request.name,
                        key: request.key,
                        value,
                        status,
                        user_data: request.user_data,
                    }
                }
            },
            |request| GetValueResponse {
                name: request.name,
                key: request.key,
                value: None,
                status: Status::Canceled,
                user_data: request.user_data,
            },
        );
    }

    fn get_chunks<F>(&self, requests: Vec<GetChunkRequest>, owner: &RequestOwner, on_complete: F)
    where
        F: Fn(GetChunkResponse) + Send + Sync + 'static,
    {
        let store = self.clone();
        submit(
            owner,
            requests,
            Arc::new(on_complete),
            move |request: GetChunkRequest| {
                let store = store.clone();
                async move {
                    let result = store
                        .get_chunk(
                            &request.key,
                            request.id,
                            request.offset,
                            request.size,
                            request.policy,
                        )
                        .await
                        .and_then(|chunk| expect_hash(&request, chunk));
                    let (chunk, status) =
                        settle(store.name(), "get_chunk", &request.name, &request.key, result);
                    let (raw_hash, raw_size, raw_data) = match chunk {
                        Some(chunk) => (chunk.raw_hash, chunk.raw_size, chunk.data),
                        None => (request.raw_hash, 0, None),
                    };
                    GetChunkResponse {
                        name: request.name,
                        key: request.key,
                        id: request.id,
                        offset: request.offset,
                        raw_size,
                        raw_hash,
                        raw_data,
                        status,
                        user_data: request.user_data,
                    }
                }
            },
            |request| GetChunkResponse {
                name: request.name,
                key: request.key,
                id: request.id,
                offset: request.offset,
                raw_size: 0,
                raw_hash: request.raw_hash,
                raw_data: None,
                status: Status::Canceled,
                user_data: request.user_data,
            },
        );
    }

    async fn put_all(&self, requests: Vec<PutRequest>, owner: &RequestOwner) -> Vec<PutResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.put(requests, owner, move |r| {
            let _ = tx.send(r);
        });
        collect(rx).await
    }

    async fn get_all(&self, requests: Vec<GetRequest>, owner: &RequestOwner) -> Vec<GetResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.get(requests, owner, move |r| {
            let _ = tx.send(r);
        });
        collect(rx).await
    }

    async fn put_values_all(
        &self,
        requests: Vec<PutValueRequest>,
        owner: &RequestOwner,
    ) -> Vec<PutValueResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.put_values(requests, owner, move |r| {
            let _ = tx.send(r);
        });
        collect(rx).await
    }

    async fn get_values_all(
        &self,
        requests: Vec<GetValueRequest>,
        owner: &RequestOwner,
    ) -> Vec<GetValueResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.get_values(requests, owner, move |r| {
            let _ = tx.send(r);
        });
        collect(rx).await
    }

    async fn get_chunks_all(
        &self,
        requests: Vec<GetChunkRequest>,
        owner: &RequestOwner,
    ) -> Vec<GetChunkResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.get_chunks(requests, owner, move |r| {
            let _ = tx.send(r);
        });
        collect(rx).await
    }
}

// =============================================================================
// Internals
// =============================================================================

/// Spawn one task per request. Each task holds a pending guard until after its
/// callback has fired, so the owner drains only once every callback ran.
fn submit<Req, Resp, Run, Fut>(
    owner: &RequestOwner,
    requests: Vec<Req>,
    on_complete: Callback<Resp>,
    run: Run,
    canceled: fn(Req) -> Resp,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
    Run: Fn(Req) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Resp> + Send + 'static,
{
    for request in requests {
        let Some(guard) = owner.track() else {
            warn!("Request submitted to a closed owner");
            on_complete(canceled(request));
            continue;
        };

        let task_owner = owner.clone();
        let on_complete = on_complete.clone();
        let run = run.clone();
        owner.spawn(async move {
            let _guard = guard;
            let Some(_admission) = task_owner.admit().await else {
                on_complete(canceled(request));
                return;
            };
            on_complete(run(request).await);
        });
    }
}

/// Drain a response channel until every sender (one per pending element) is
/// gone
async fn collect<R>(mut rx: mpsc::UnboundedReceiver<R>) -> Vec<R> {
    let mut responses = Vec::new();
    while let Some(response) = rx.recv().await {
        responses.push(response);
    }
    responses
}

/// Downgrade a store result to a response status, logging the failure
fn settle<T>(store: &str, op: &'static str, name: &str, key: &CacheKey, result: Result<T>) -> (Option<T>, Status) {
    match result {
        Ok(value) => (Some(value), Status::Ok),
        Err(Error::Canceled) => (None, Status::Canceled),
        Err(e) if e.is_not_found() => {
            debug!(store, op, name, %key, "Cache miss");
            (None, Status::Error)
        }
        Err(e) => {
            warn!(store, op, name, %key, error = %e, "Cache request failed");
            (None, Status::Error)
        }
    }
}

fn expect_hash(request: &GetChunkRequest, chunk: ChunkData) -> Result<ChunkData> {
    if !request.raw_hash.is_zero() && request.raw_hash != chunk.raw_hash {
        return Err(Error::HashMismatch {
            expected: request.raw_hash,
            actual: chunk.raw_hash,
        });
    }
    Ok(chunk)
}

// =============================================================================
// Tests
// =============================================================================
