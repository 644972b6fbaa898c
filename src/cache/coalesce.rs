//! Single-flight request coalescing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use super::signature::RequestSignature;
use crate::errors::{GitHubError, GitHubErrorKind, GitHubResult};
use crate::observability::{Telemetry, TelemetryEvent};
use crate::resilience::RequestContext;

type SharedCall<T> = Shared<BoxFuture<'static, GitHubResult<T>>>;

struct CoalescerShards<T: Clone> {
    shards: Vec<Mutex<HashMap<RequestSignature, SharedCall<T>>>>,
}

impl<T: Clone> CoalescerShards<T> {
    fn shard(&self, signature: &RequestSignature) -> &Mutex<HashMap<RequestSignature, SharedCall<T>>> {
        &self.shards[signature.shard(self.shards.len())]
    }
}

/// Outcome of [`RequestCoalescer::coalesce`].
#[derive(Debug)]
pub struct Coalesced<T> {
    /// Result shared by every caller of the same flight.
    pub result: GitHubResult<T>,
    /// True when this caller joined a call started by someone else.
    pub joined: bool,
}

/// Runs at most one call per signature at a time.
///
/// The call runs on its own task. Callers await a shared handle through
/// their own [`RequestContext`], so a caller that gives up only detaches;
/// the call completes for everyone else. The in-flight entry is removed
/// when the call finishes, before its result is observed.
pub struct RequestCoalescer<T: Clone + Send + Sync + 'static> {
    inner: Arc<CoalescerShards<T>>,
    telemetry: Telemetry,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for RequestCoalescer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("shards", &self.inner.shards.len())
            .field("in_flight", &self.in_flight_len())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    /// Creates a coalescer with `shards` independently locked maps.
    pub fn new(shards: usize, telemetry: Telemetry) -> Self {
        Self {
            inner: Arc::new(CoalescerShards {
                shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            }),
            telemetry,
        }
    }

    /// Joins the in-flight call for `signature`, or starts one with `call`.
    ///
    /// `call` is only invoked when no call for the signature is running.
    pub async fn coalesce<F, Fut>(
        &self,
        signature: &RequestSignature,
        ctx: &RequestContext,
        call: F,
    ) -> Coalesced<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GitHubResult<T>> + Send + 'static,
    {
        if let Err(error) = ctx.check() {
            return Coalesced {
                result: Err(error),
                joined: false,
            };
        }

        let (flight, joined) = {
            let mut shard = self.inner.shard(signature).lock();
            match shard.get(signature) {
                Some(flight) => (flight.clone(), true),
                None => {
                    let flight = self.start(signature.clone(), call());
                    shard.insert(signature.clone(), flight.clone());
                    (flight, false)
                }
            }
        };

        if joined {
            self.telemetry.emit(TelemetryEvent::RequestCoalesced {
                signature: signature.to_string(),
            });
        }
        Coalesced {
            result: ctx.run(flight).await,
            joined,
        }
    }

    fn start<Fut>(&self, signature: RequestSignature, call: Fut) -> SharedCall<T>
    where
        Fut: Future<Output = GitHubResult<T>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = call.await;
            inner.shard(&signature).lock().remove(&signature);
            result
        });
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => Err(GitHubError::new(
                    GitHubErrorKind::Unknown,
                    format!("coalesced request aborted: {}", join_error),
                )),
            }
        }
        .boxed()
        .shared()
    }

    /// Calls currently in flight.
    pub fn in_flight_len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.lock().len()).sum()
    }
}
