//! Sync sources and block catch-up.
//!
//! `SyncSourcePool` keeps the configured sources plus the ones learned from
//! them, `SyncSourceChecker` refreshes the learned set, and `Syncer` pulls
//! blocks up to a target height and hands them to the block importer.

use crate::base::{CancellationToken, Height, NetworkId, NodeAddress, Threshold};
use crate::block::{BlockError, BlockImporter, BlockMap, ImportBlock};
use crate::config::LocalParams;
use crate::error::ErrorKind;
use crate::network::{ConnInfo, NetworkClient, NetworkError};
use crate::storage::{PermanentDatabase, StorageError};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Blocks fetched before each import.
const SYNC_BATCH: i64 = 10;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no sync sources available")]
    NoSources,

    #[error("gave up fetching block {height}")]
    RetryExhausted { height: Height },

    #[error("sync canceled")]
    Canceled,

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NoSources => ErrorKind::Network,
            SyncError::RetryExhausted { .. } => ErrorKind::NotFound,
            SyncError::Canceled => ErrorKind::Other,
            SyncError::Block(e) => e.kind(),
            SyncError::Network(e) => e.kind(),
            SyncError::Storage(e) => e.kind(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    non_fixed: Vec<ConnInfo>,
    problems: HashMap<NodeAddress, Instant>,
    next: usize,
}

/// Fixed sources come from configuration and are never replaced; the
/// non-fixed ones are whatever the checker last verified. A source marked
/// with a problem is skipped until `renew_timeout` passes.
pub struct SyncSourcePool {
    fixed: Vec<ConnInfo>,
    renew_timeout: Duration,
    inner: RwLock<PoolInner>,
}

impl SyncSourcePool {
    pub fn new(fixed: Vec<ConnInfo>, renew_timeout: Duration) -> Self {
        SyncSourcePool {
            fixed,
            renew_timeout,
            inner: RwLock::new(PoolInner::default()),
        }
    }

    pub fn fixed(&self) -> &[ConnInfo] {
        &self.fixed
    }

    pub fn sources(&self) -> Vec<ConnInfo> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        self.fixed
            .iter()
            .chain(inner.non_fixed.iter())
            .filter(|c| seen.insert(c.address.clone()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next healthy source, round-robin.
    pub fn pick(&self) -> Option<ConnInfo> {
        let sources = self.sources();
        if sources.is_empty() {
            return None;
        }
        let mut inner = self.inner.write();
        let now = Instant::now();
        inner
            .problems
            .retain(|_, at| now.duration_since(*at) < self.renew_timeout);

        for _ in 0..sources.len() {
            let i = inner.next % sources.len();
            inner.next = inner.next.wrapping_add(1);
            let conn = &sources[i];
            if !inner.problems.contains_key(&conn.address) {
                return Some(conn.clone());
            }
        }
        None
    }

    pub fn mark_problem(&self, address: &NodeAddress) {
        debug!(source = %address, "sync source marked with problem");
        self.inner.write().problems.insert(address.clone(), Instant::now());
    }

    pub fn is_problem(&self, address: &NodeAddress) -> bool {
        self.inner
            .read()
            .problems
            .get(address)
            .is_some_and(|at| at.elapsed() < self.renew_timeout)
    }

    /// Replaces the learned sources; fixed addresses are left out.
    pub fn update_non_fixed(&self, sources: Vec<ConnInfo>) {
        let fixed: HashSet<&NodeAddress> = self.fixed.iter().map(|c| &c.address).collect();
        let mut seen = HashSet::new();
        let non_fixed: Vec<ConnInfo> = sources
            .into_iter()
            .filter(|c| !fixed.contains(&c.address) && seen.insert(c.address.clone()))
            .collect();
        debug!(count = non_fixed.len(), "non-fixed sync sources updated");
        self.inner.write().non_fixed = non_fixed;
    }
}

/// Periodically asks the fixed sources for the sources they know and keeps
/// the ones that prove their key with a signed challenge.
pub struct SyncSourceChecker {
    local: NodeAddress,
    network_id: NetworkId,
    client: Arc<dyn NetworkClient>,
    pool: Arc<SyncSourcePool>,
    interval: Duration,
    timeout: Duration,
}

impl SyncSourceChecker {
    pub fn new(
        local: NodeAddress,
        network_id: NetworkId,
        client: Arc<dyn NetworkClient>,
        pool: Arc<SyncSourcePool>,
        params: &LocalParams,
    ) -> Self {
        SyncSourceChecker {
            local,
            network_id,
            client,
            pool,
            interval: params.sync_source_checker_interval,
            timeout: params.timeout_request,
        }
    }

    /// One pass; returns how many learned sources were kept.
    pub async fn check(&self) -> usize {
        let fixed: HashSet<NodeAddress> = self.pool.fixed().iter().map(|c| c.address.clone()).collect();
        let mut candidates: BTreeMap<NodeAddress, ConnInfo> = BTreeMap::new();

        for conn in self.pool.fixed() {
            match tokio::time::timeout(self.timeout, self.client.sync_sources(conn)).await {
                Ok(Ok(found)) => {
                    for c in found {
                        if c.address != self.local && !fixed.contains(&c.address) {
                            candidates.entry(c.address.clone()).or_insert(c);
                        }
                    }
                }
                Ok(Err(e)) => debug!(source = %conn, error = %e, "failed to ask sync sources"),
                Err(_) => debug!(source = %conn, "asking sync sources timed out"),
            }
        }

        let mut verified = Vec::with_capacity(candidates.len());
        for conn in candidates.into_values() {
            if self.challenge(&conn).await {
                verified.push(conn);
            }
        }
        let count = verified.len();
        self.pool.update_non_fixed(verified);
        count
    }

    async fn challenge(&self, conn: &ConnInfo) -> bool {
        let mut input = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut input);

        match tokio::time::timeout(self.timeout, self.client.node_challenge(conn, &input)).await {
            Ok(Ok(sig)) => match conn.publickey.verify(&self.network_id, &input, &sig) {
                Ok(()) => true,
                Err(e) => {
                    warn!(source = %conn, error = %e, "sync source failed challenge");
                    false
                }
            },
            Ok(Err(e)) => {
                debug!(source = %conn, error = %e, "challenge request failed");
                false
            }
            Err(_) => {
                debug!(source = %conn, "challenge timed out");
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let kept = self.check().await;
                    debug!(kept, "sync sources checked");
                }
                _ = cancel.canceled() => return,
            }
        }
    }
}

/// Fetches and imports blocks until the local tip reaches the target. The
/// target can be raised while syncing, never lowered.
pub struct Syncer {
    network_id: NetworkId,
    threshold: Threshold,
    params: LocalParams,
    db: Arc<dyn PermanentDatabase>,
    block_root: PathBuf,
    client: Arc<dyn NetworkClient>,
    sources: Arc<SyncSourcePool>,
    target: Mutex<Height>,
}

impl Syncer {
    pub fn new(
        network_id: NetworkId,
        params: LocalParams,
        db: Arc<dyn PermanentDatabase>,
        block_root: PathBuf,
        client: Arc<dyn NetworkClient>,
        sources: Arc<SyncSourcePool>,
    ) -> Self {
        Syncer {
            network_id,
            threshold: params.threshold,
            params,
            db,
            block_root,
            client,
            sources,
            target: Mutex::new(Height::NIL),
        }
    }

    pub fn target(&self) -> Height {
        *self.target.lock()
    }

    /// Returns false when `height` is not above the current target.
    pub fn raise_target(&self, height: Height) -> bool {
        let mut target = self.target.lock();
        if height <= *target {
            return false;
        }
        debug!(from = %*target, to = %height, "sync target raised");
        *target = height;
        true
    }

    fn tip(&self) -> Result<Height, SyncError> {
        Ok(self
            .db
            .last_blockmap()?
            .map(|bm| bm.height())
            .unwrap_or(Height::NIL))
    }

    /// Syncs up to `target`, or further when the target is raised meanwhile.
    /// Returns the new tip.
    pub async fn sync(&self, target: Height, cancel: &CancellationToken) -> Result<Height, SyncError> {
        self.raise_target(target);
        let mut failures = 0u64;

        loop {
            if cancel.is_canceled() {
                return Err(SyncError::Canceled);
            }
            let tip = self.tip()?;
            let target = self.target();
            if tip >= target {
                info!(tip = %tip, "sync finished");
                return Ok(tip);
            }

            let from = tip.next();
            let to = Height::new((from.get() + SYNC_BATCH - 1).min(target.get()));
            let mut blocks = Vec::new();
            let mut used = HashSet::new();
            let mut h = from;
            while h <= to {
                let (block, source) = self.fetch_block(h, cancel).await?;
                used.insert(source);
                blocks.push(block);
                h = h.next();
            }

            let importer = BlockImporter::new(
                self.network_id.clone(),
                self.threshold,
                self.block_root.clone(),
                Arc::clone(&self.db),
            );
            let imported = tokio::task::spawn_blocking(move || importer.import(blocks))
                .await
                .map_err(|e| SyncError::Block(BlockError::Invalid(format!("import worker: {e}"))))?;

            match imported {
                Ok(new_tip) => {
                    failures = 0;
                    info!(from = %from, to = %new_tip, target = %self.target(), "blocks synced");
                }
                Err(e) if e.kind() == ErrorKind::Invalid => {
                    failures += 1;
                    warn!(from = %from, to = %to, error = %e, "synced blocks rejected");
                    for address in &used {
                        self.sources.mark_problem(address);
                    }
                    if failures >= self.params.sync_retry_limit.max(1) {
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One block map and its items, all from the same source.
    async fn fetch_block(
        &self,
        height: Height,
        cancel: &CancellationToken,
    ) -> Result<(ImportBlock, NodeAddress), SyncError> {
        if self.sources.is_empty() {
            return Err(SyncError::NoSources);
        }

        for attempt in 0..self.params.sync_retry_limit.max(1) {
            if cancel.is_canceled() {
                return Err(SyncError::Canceled);
            }
            let Some(conn) = self.sources.pick() else {
                debug!(%height, attempt, "every sync source has a problem, waiting");
                tokio::time::sleep(self.params.sync_retry_interval).await;
                continue;
            };

            match self.fetch_from(&conn, height).await {
                Ok(Some(block)) => return Ok((block, conn.address)),
                Ok(None) => debug!(%height, source = %conn, "source does not have block"),
                Err(e) => {
                    debug!(%height, source = %conn, error = %e, "block fetch failed");
                    self.sources.mark_problem(&conn.address);
                }
            }
            tokio::time::sleep(self.params.sync_retry_interval).await;
        }

        Err(SyncError::RetryExhausted { height })
    }

    async fn fetch_from(&self, conn: &ConnInfo, height: Height) -> Result<Option<ImportBlock>, NetworkError> {
        let timeout = self.params.timeout_request;
        let Some(blockmap) = self.timed(conn, timeout, self.client.blockmap(conn, height)).await? else {
            return Ok(None);
        };
        if blockmap.height() != height {
            return Err(NetworkError::Status {
                url: conn.url.clone(),
                status: 400,
                message: format!("asked block map {height}, got {}", blockmap.height()),
            });
        }

        let mut items = BTreeMap::new();
        for item in &blockmap.items {
            let req = self.client.blockmap_item(conn, height, item.item_type);
            match self.timed(conn, timeout, req).await? {
                Some(raw) => {
                    items.insert(item.item_type, raw);
                }
                None => return Ok(None),
            }
        }
        Ok(Some(ImportBlock { blockmap, items }))
    }

    async fn timed<T>(
        &self,
        conn: &ConnInfo,
        timeout: Duration,
        fut: impl std::future::Future<Output = Result<T, NetworkError>>,
    ) -> Result<T, NetworkError> {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| NetworkError::Timeout(conn.url.clone()))?
    }

    /// The last block map a source knows, for deciding sync targets.
    pub async fn last_remote_blockmap(&self) -> Option<BlockMap> {
        let conn = self.sources.pick()?;
        match self
            .timed(&conn, self.params.timeout_request, self.client.last_blockmap(&conn, None))
            .await
        {
            Ok((bm, _)) => bm,
            Err(e) => {
                debug!(source = %conn, error = %e, "last block map request failed");
                None
            }
        }
    }
}
