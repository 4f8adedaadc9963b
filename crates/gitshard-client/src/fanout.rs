//! Scatter work across shards and merge the answers.
//!
//! Items are grouped by the shard that owns them, one call is issued per
//! shard with at most [`MAX_CONCURRENT_SHARD_CALLS`] in flight, and the
//! results are merged under one of two policies:
//!
//! * [`MergePolicy::FailFast`]: the first failure cancels the remaining
//!   calls and is returned; partial results are discarded.
//! * [`MergePolicy::BestEffort`]: every shard is attempted; successes are
//!   merged and failures are collected into a [`MultiError`].
//!
//! [`MAX_CONCURRENT_SHARD_CALLS`]: crate::config::MAX_CONCURRENT_SHARD_CALLS

use crate::context::CallContext;
use crate::routing::ShardDirectory;
use futures::stream::{self, StreamExt};
use gitshard_core::{DomainError, MultiError, RepoName, TransportErrorKind};
use std::collections::HashMap;
use std::future::Future;
use tracing::debug;

/// Items owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardBatch<W> {
    pub addr: String,
    pub items: Vec<W>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    FailFast,
    BestEffort,
}

/// Merged value plus the failures of a best-effort fan-out.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialResult<M> {
    pub value: M,
    pub error: Option<MultiError>,
}

impl<M> PartialResult<M> {
    /// The merged value, or the collected failures if any shard failed.
    pub fn into_result(self) -> Result<M, MultiError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.value),
        }
    }
}

/// Group items by owning shard, keeping first-appearance order of shards
/// and of items within a shard.
pub fn group_by_shard<W, F>(
    directory: &ShardDirectory,
    items: impl IntoIterator<Item = W>,
    repo_of: F,
) -> Result<Vec<ShardBatch<W>>, DomainError>
where
    F: Fn(&W) -> &RepoName,
{
    let mut batches: Vec<ShardBatch<W>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for item in items {
        let addr = directory.resolve(repo_of(&item)).ok_or_else(no_shards)?;
        match index.get(addr) {
            Some(&i) => batches[i].items.push(item),
            None => {
                index.insert(addr.to_string(), batches.len());
                batches.push(ShardBatch {
                    addr: addr.to_string(),
                    items: vec![item],
                });
            }
        }
    }
    Ok(batches)
}

/// One empty batch per configured address.
pub fn every_shard<W>(directory: &ShardDirectory) -> Vec<ShardBatch<W>> {
    directory
        .addresses()
        .iter()
        .map(|addr| ShardBatch {
            addr: addr.clone(),
            items: Vec::new(),
        })
        .collect()
}

pub(crate) fn no_shards() -> DomainError {
    DomainError::transport(TransportErrorKind::NoShards, "no shard addresses configured")
}

/// Runs per-shard calls with bounded concurrency.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    limit: usize,
}

impl Dispatcher {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Call `per_shard` for every batch and fold the successes into `init`
    /// with `merge`.
    ///
    /// Each call gets a child of `ctx`. Under `FailFast` the first failure
    /// cancels that child context, stops issuing calls and is returned.
    pub async fn dispatch<W, T, M, F, Fut, G>(
        &self,
        ctx: &CallContext,
        batches: Vec<ShardBatch<W>>,
        policy: MergePolicy,
        per_shard: F,
        init: M,
        mut merge: G,
    ) -> Result<PartialResult<M>, DomainError>
    where
        F: Fn(CallContext, ShardBatch<W>) -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
        G: FnMut(&mut M, &str, T),
    {
        let child = ctx.child();
        let shards = batches.len();

        let mut results = stream::iter(batches)
            .map(|batch| {
                let addr = batch.addr.clone();
                let call = per_shard(child.clone(), batch);
                async move { (addr, call.await) }
            })
            .buffer_unordered(self.limit);

        let mut value = init;
        let mut errors = MultiError::new();

        while let Some((addr, result)) = results.next().await {
            match result {
                Ok(output) => merge(&mut value, &addr, output),
                Err(err) => match policy {
                    MergePolicy::FailFast => {
                        debug!(shards, "Fan-out aborted by {}: {}", addr, err);
                        child.cancel();
                        return Err(err);
                    }
                    MergePolicy::BestEffort => errors.push(addr, err),
                },
            }
        }

        if !errors.is_empty() {
            debug!(shards, failed = errors.len(), "Fan-out finished with failures");
        }
        Ok(PartialResult {
            value,
            error: errors.into_option(),
        })
    }
}
