//! Proposal processors: turn an INIT-majority proposal into a block
//! manifest, then save the block once the ACCEPT majority agrees.

use super::fact::ProposalSignFact;
use super::proposal::ProposerSelector;
use super::voteproof::Voteproof;
use super::{BallotError, NodeArgs};
use crate::base::{CancellationToken, Hash, Height};
use crate::block::{BlockError, BlockMap, BlockWriter, Manifest};
use crate::error::ErrorKind;
use crate::network::NetworkError;
use crate::state::{Operation, OperationError, PreProcessContext, PreProcessResult};
use crate::storage::{LastStates, PermanentDatabase, Pool, StorageError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("retry processing: {0}")]
    Retry(String),

    #[error("ignore processing: {0}")]
    Ignore(String),

    #[error("processing canceled")]
    Canceled,

    #[error("invalid proposal: {0}")]
    InvalidProposal(String),

    #[error("ACCEPT voteproof accepts {found}, processed block is {expected}")]
    BlockMismatch { expected: Hash, found: Hash },

    #[error("processor is {0}")]
    WrongStatus(ProcessorStatus),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ballot(#[from] BallotError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl ProcessorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessorError::Retry(_) => ErrorKind::RetryProposalProcessor,
            ProcessorError::Ignore(_) => ErrorKind::IgnoreProposalProcessor,
            ProcessorError::Canceled | ProcessorError::WrongStatus(_) => ErrorKind::Other,
            ProcessorError::InvalidProposal(_) | ProcessorError::BlockMismatch { .. } => ErrorKind::Invalid,
            ProcessorError::Block(e) => e.kind(),
            ProcessorError::Operation(e) => e.kind(),
            ProcessorError::Storage(e) => e.kind(),
            ProcessorError::Ballot(e) => e.kind(),
            ProcessorError::Network(_) => ErrorKind::RetryProposalProcessor,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorStatus {
    Preparing,
    Processing,
    Processed,
    Saving,
    Saved,
    Canceled,
    Failed,
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessorStatus::Preparing => "preparing",
            ProcessorStatus::Processing => "processing",
            ProcessorStatus::Processed => "processed",
            ProcessorStatus::Saving => "saving",
            ProcessorStatus::Saved => "saved",
            ProcessorStatus::Canceled => "canceled",
            ProcessorStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Processes one proposal at one height.
pub struct ProposalProcessor {
    args: NodeArgs,
    proposal: ProposalSignFact,
    previous: Manifest,
    init: Voteproof,
    writer: Arc<BlockWriter>,
    cancel: CancellationToken,
    status: Mutex<ProcessorStatus>,
}

impl ProposalProcessor {
    pub fn new(args: NodeArgs, proposal: ProposalSignFact, previous: Manifest, init: Voteproof) -> Self {
        let writer = Arc::new(BlockWriter::new(
            args.local.clone(),
            args.network_id.clone(),
            proposal.point().height,
            args.block_root.clone(),
            Arc::clone(&args.db),
        ));
        ProposalProcessor {
            args,
            proposal,
            previous,
            init,
            writer,
            cancel: CancellationToken::new(),
            status: Mutex::new(ProcessorStatus::Preparing),
        }
    }

    pub fn height(&self) -> Height {
        self.proposal.point().height
    }

    pub fn proposal(&self) -> &ProposalSignFact {
        &self.proposal
    }

    pub fn status(&self) -> ProcessorStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: ProcessorStatus) {
        *self.status.lock() = status;
    }

    /// Runs the proposal's operations against the last states and returns
    /// the manifest of the resulting block.
    pub async fn process(&self) -> Result<Manifest, ProcessorError> {
        let result = self.run().await;
        match &result {
            Ok(_) => self.set_status(ProcessorStatus::Processed),
            Err(ProcessorError::Canceled) => self.set_status(ProcessorStatus::Canceled),
            Err(_) => self.set_status(ProcessorStatus::Failed),
        }
        result
    }

    /// The proposal must be signed by the selected proposer of its point.
    fn check_proposer(&self) -> Result<(), ProcessorError> {
        let point = self.proposal.point();
        let suffrage = self
            .args
            .db
            .suffrage(point.height)?
            .ok_or_else(|| StorageError::NotFound(format!("suffrage for {}", point.height)))?;
        let expected = ProposerSelector::select(point, &self.previous.hash, &suffrage)
            .ok_or_else(|| ProcessorError::InvalidProposal(format!("no proposer for {point}")))?;
        if self.proposal.proposer() != &expected.address || self.proposal.sign.signer != expected.publickey {
            return Err(ProcessorError::InvalidProposal(format!(
                "proposal {} by {}, expected proposer {}",
                self.proposal.hash(),
                self.proposal.proposer(),
                expected.address
            )));
        }
        Ok(())
    }

    async fn run(&self) -> Result<Manifest, ProcessorError> {
        let height = self.height();
        if self.args.db.blockmap(height)?.is_some() {
            return Err(ProcessorError::Ignore(format!("block {height} already saved")));
        }
        if self.previous.height.next() != height || self.proposal.fact.previous_block != self.previous.hash {
            return Err(ProcessorError::InvalidProposal(format!(
                "proposal {} does not follow block {}",
                self.proposal.hash(),
                self.previous.hash
            )));
        }
        self.check_proposer()?;

        self.writer.set_proposal(self.proposal.clone())?;

        let mut operations = self.collect_operations().await?;
        operations.extend(self.init.expels().iter().cloned().map(|e| e.into_operation()));
        operations.sort_by_key(|op| op.fact_hash());
        operations.dedup_by_key(|op| op.fact_hash());
        self.check_canceled()?;

        self.set_status(ProcessorStatus::Processing);
        self.writer.set_operations_size(operations.len())?;

        let accepted = self.pre_process(operations)?;
        self.check_canceled()?;

        let db = Arc::clone(&self.args.db);
        let writer = Arc::clone(&self.writer);
        let cancel = self.cancel.clone();
        let workers = self.args.params.process_concurrency.max(1);
        tokio::task::spawn_blocking(move || {
            process_operations(db.as_ref(), &writer, height, &accepted, workers, &cancel)
        })
        .await
        .map_err(|e| ProcessorError::Retry(format!("process workers: {e}")))??;
        self.check_canceled()?;

        let manifest = self.writer.manifest(Some(&self.previous))?;
        info!(
            height = %height,
            proposal = %self.proposal.hash(),
            manifest = %manifest.hash,
            "proposal processed"
        );
        Ok(manifest)
    }

    fn check_canceled(&self) -> Result<(), ProcessorError> {
        if self.cancel.is_canceled() {
            return Err(ProcessorError::Canceled);
        }
        Ok(())
    }

    /// The proposal's operations from the pool, or from peers.
    async fn collect_operations(&self) -> Result<Vec<Operation>, ProcessorError> {
        let mut operations = Vec::with_capacity(self.proposal.fact.operations.len());
        for po in &self.proposal.fact.operations {
            self.check_canceled()?;
            let op = match self.args.pool.operation(&po.operation)? {
                Some(op) => op,
                None => self.fetch_operation(&po.operation).await?,
            };
            if op.fact_hash() != po.fact {
                return Err(ProcessorError::InvalidProposal(format!(
                    "operation {} has fact {}, proposal lists {}",
                    po.operation,
                    op.fact_hash(),
                    po.fact
                )));
            }
            operations.push(op);
        }
        Ok(operations)
    }

    async fn fetch_operation(&self, hash: &Hash) -> Result<Operation, ProcessorError> {
        for conn in &self.args.peers {
            let req = self.args.client.operation(conn, hash);
            match tokio::time::timeout(self.args.params.timeout_request, req).await {
                Ok(Ok(Some(op))) if &op.hash == hash => {
                    debug!(operation = %hash, peer = %conn, "operation fetched");
                    return Ok(op);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(operation = %hash, peer = %conn, error = %e, "operation fetch failed"),
                Err(_) => debug!(operation = %hash, peer = %conn, "operation fetch timed out"),
            }
        }
        Err(ProcessorError::Retry(format!("operation {hash} not found")))
    }

    /// Pre-processes in fact-hash order; returns the indexed operations to
    /// process. Skipped ones are recorded as not in state.
    fn pre_process(&self, operations: Vec<Operation>) -> Result<Vec<(usize, Operation)>, ProcessorError> {
        let get_state = LastStates(self.args.db.as_ref());
        let mut ctx = PreProcessContext {
            height: self.height(),
            network_id: &self.args.network_id,
            threshold: self.args.params.threshold,
            get_state: &get_state,
            admitted_candidates: 0,
        };

        let mut accepted = Vec::with_capacity(operations.len());
        for (i, op) in operations.into_iter().enumerate() {
            if self.args.db.exists_in_state_operation(&op.fact_hash())? {
                self.writer
                    .set_process_result(i, op, false, Some("already in state".to_string()))?;
                continue;
            }
            if let Err(e) = op.is_valid(&self.args.network_id) {
                self.writer.set_process_result(i, op, false, Some(e.to_string()))?;
                continue;
            }
            match op.pre_process(&mut ctx) {
                Ok(PreProcessResult::Accepted) => accepted.push((i, op)),
                Ok(PreProcessResult::Skip(reason)) => {
                    debug!(operation = %op.hash, %reason, "operation skipped");
                    self.writer.set_process_result(i, op, false, Some(reason))?;
                }
                Err(e) if e.kind() == ErrorKind::Invalid => {
                    self.writer.set_process_result(i, op, false, Some(e.to_string()))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(accepted)
    }

    /// Finishes the block with its voteproofs. Blocking: file and database
    /// writes happen here.
    pub fn save(&self, accept: Voteproof) -> Result<BlockMap, ProcessorError> {
        {
            let mut status = self.status.lock();
            match *status {
                ProcessorStatus::Processed | ProcessorStatus::Saving => *status = ProcessorStatus::Saving,
                ProcessorStatus::Saved => {}
                other => return Err(ProcessorError::WrongStatus(other)),
            }
        }

        let manifest = self.writer.manifest(Some(&self.previous))?;
        let found = accept
            .accept_majority()
            .map(|f| f.new_block)
            .ok_or_else(|| ProcessorError::InvalidProposal("ACCEPT voteproof without majority".to_string()))?;
        if found != manifest.hash {
            return Err(ProcessorError::BlockMismatch {
                expected: manifest.hash,
                found,
            });
        }

        self.writer.set_init_voteproof(self.init.clone())?;
        self.writer.set_accept_voteproof(accept)?;
        let blockmap = self.writer.save()?;
        self.set_status(ProcessorStatus::Saved);
        Ok(blockmap)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        if self.status() == ProcessorStatus::Saved {
            return;
        }
        self.writer.cancel();
        self.set_status(ProcessorStatus::Canceled);
        debug!(height = %self.height(), proposal = %self.proposal.hash(), "processor canceled");
    }
}

/// Processes `operations` on up to `workers` threads. Operations failing
/// with an invalid-kind error are kept out of state; any other error
/// stops the rest.
fn process_operations(
    db: &dyn PermanentDatabase,
    writer: &BlockWriter,
    height: Height,
    operations: &[(usize, Operation)],
    workers: usize,
    cancel: &CancellationToken,
) -> Result<(), ProcessorError> {
    let next = AtomicUsize::new(0);
    let failed: Mutex<Option<ProcessorError>> = Mutex::new(None);
    let get_state = LastStates(db);

    std::thread::scope(|s| {
        for _ in 0..workers.min(operations.len()) {
            s.spawn(|| loop {
                if cancel.is_canceled() || failed.lock().is_some() {
                    return;
                }
                let Some((i, op)) = operations.get(next.fetch_add(1, Ordering::Relaxed)) else {
                    return;
                };
                let res = match op.process(height, &get_state) {
                    Ok(values) => writer
                        .set_states(op.fact_hash(), values)
                        .and_then(|_| writer.set_process_result(*i, op.clone(), true, None)),
                    Err(e) if e.kind() == ErrorKind::Invalid => {
                        writer.set_process_result(*i, op.clone(), false, Some(e.to_string()))
                    }
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = res {
                    failed.lock().get_or_insert(e.into());
                    return;
                }
            });
        }
    });

    if cancel.is_canceled() {
        return Err(ProcessorError::Canceled);
    }
    match failed.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Holds the one processor currently working. Starting a new one cancels
/// the previous.
pub struct ProposalProcessors {
    args: NodeArgs,
    current: Mutex<Option<Arc<ProposalProcessor>>>,
}

impl ProposalProcessors {
    pub fn new(args: NodeArgs) -> Self {
        ProposalProcessors {
            args,
            current: Mutex::new(None),
        }
    }

    pub fn current(&self) -> Option<Arc<ProposalProcessor>> {
        self.current.lock().clone()
    }

    fn replace(&self, processor: Option<Arc<ProposalProcessor>>) {
        let old = std::mem::replace(&mut *self.current.lock(), processor);
        if let Some(old) = old {
            old.cancel();
        }
    }

    /// Processes `proposal`, retrying while the failure is retryable.
    pub async fn process(
        &self,
        proposal: ProposalSignFact,
        previous: Manifest,
        init: Voteproof,
    ) -> Result<Manifest, ProcessorError> {
        let limit = self.args.params.proposal_retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let processor = Arc::new(ProposalProcessor::new(
                self.args.clone(),
                proposal.clone(),
                previous.clone(),
                init.clone(),
            ));
            self.replace(Some(Arc::clone(&processor)));

            match processor.process().await {
                Ok(manifest) => return Ok(manifest),
                Err(e) if e.kind() == ErrorKind::RetryProposalProcessor && attempt < limit => {
                    warn!(attempt, error = %e, proposal = %proposal.hash(), "processing failed, retrying");
                    tokio::time::sleep(self.args.params.proposal_retry_interval).await;
                    if !self.is_current(&processor) {
                        return Err(ProcessorError::Canceled);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn is_current(&self, processor: &Arc<ProposalProcessor>) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|p| Arc::ptr_eq(p, processor))
    }

    /// Saves the current processor's block. Runs the writes on the blocking
    /// pool.
    pub async fn save(&self, accept: Voteproof) -> Result<BlockMap, ProcessorError> {
        let processor = self
            .current()
            .ok_or(ProcessorError::WrongStatus(ProcessorStatus::Canceled))?;
        if processor.height() != accept.height() {
            return Err(ProcessorError::InvalidProposal(format!(
                "processor at {} got ACCEPT voteproof of {}",
                processor.height(),
                accept.height()
            )));
        }

        let p = Arc::clone(&processor);
        let blockmap = tokio::task::spawn_blocking(move || p.save(accept))
            .await
            .map_err(|e| ProcessorError::Retry(format!("save worker: {e}")))??;

        let mut current = self.current.lock();
        if current.as_ref().is_some_and(|p| Arc::ptr_eq(p, &processor)) {
            *current = None;
        }
        Ok(blockmap)
    }

    pub fn cancel(&self) {
        self.replace(None);
    }
}
