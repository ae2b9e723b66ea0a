//! Time-bounded cache of cluster nodes.
//!
//! Readers take a short read lock. A refresh is serialized by an async mutex
//! and re-checks freshness after acquiring it, so concurrent misses cause a
//! single upstream fetch. The node list is swapped in one write.

use super::types::NodeInfo;
use crate::error::{Error, Result};
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct CacheState {
    nodes: Vec<NodeInfo>,
    last_update: Option<Instant>,
}

/// Cluster node list with a time-to-live.
#[derive(Debug)]
pub struct NodeCache {
    ttl: Duration,
    state: RwLock<CacheState>,
    refresh: Mutex<()>,
}

impl NodeCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: RwLock::new(CacheState::default()),
            refresh: Mutex::new(()),
        }
    }

    /// Time of the last successful refresh.
    pub fn last_update(&self) -> Option<Instant> {
        self.state.read().ok().and_then(|s| s.last_update)
    }

    /// Returns true if the cache was never filled or its TTL has elapsed.
    pub fn is_expired(&self) -> bool {
        self.fresh().is_none()
    }

    /// Cached nodes, if still within the TTL.
    pub fn fresh(&self) -> Option<Vec<NodeInfo>> {
        let state = self.state.read().ok()?;
        let updated = state.last_update?;
        (updated.elapsed() <= self.ttl).then(|| state.nodes.clone())
    }

    /// Replaces the node list and stamps the refresh time.
    pub fn replace(&self, nodes: Vec<NodeInfo>) -> Result<()> {
        let mut state = self.state.write().map_err(|_| Error::lock_poisoned())?;
        *state = CacheState {
            nodes,
            last_update: Some(Instant::now()),
        };
        Ok(())
    }

    /// Returns cached nodes or fetches, stores and returns a fresh list.
    ///
    /// A failed fetch leaves the previous contents in place.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<Vec<NodeInfo>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<NodeInfo>>>,
    {
        if let Some(nodes) = self.fresh() {
            return Ok(nodes);
        }

        let _guard = self.refresh.lock().await;
        if let Some(nodes) = self.fresh() {
            return Ok(nodes);
        }

        let nodes = fetch().await?;
        self.replace(nodes.clone())?;
        tracing::debug!(count = nodes.len(), "Node cache refreshed");
        Ok(nodes)
    }
}
