//! The node's state machine.
//!
//! One handler is active at a time. The driver feeds it voteproofs from the
//! ballotbox, timer ticks and events from tasks the handler spawned, and
//! switches handlers when one asks for it.

mod booting;
mod broken;
mod consensus;
mod handover;
mod joining;
mod stopped;
mod syncing;

pub(crate) use booting::BootingHandler;
pub(crate) use broken::BrokenHandler;
pub(crate) use consensus::ConsensusHandler;
pub(crate) use handover::HandoverHandler;
pub(crate) use joining::JoiningHandler;
pub(crate) use stopped::StoppedHandler;
pub(crate) use syncing::SyncingHandler;

use super::ballot::Ballot;
use super::ballotbox::Ballotbox;
use super::fact::ProposalSignFact;
use super::processor::{ProcessorError, ProposalProcessors};
use super::proposal::{unavailable_proposal, ProposalMaker, ProposalSelector};
use super::queue::{BallotQueue, Broadcaster};
use super::suffrage::{DatabaseSuffrage, Suffrage};
use super::sync::{SyncError, SyncSourcePool, Syncer};
use super::timers::{TimerId, TimerTick, Timers};
use super::voteproof::{LastVoteproofs, Voteproof};
use super::NodeArgs;
use crate::base::{Hash, Height, Point};
use crate::block::{BlockMap, Manifest};
use crate::error::{ErrorKind, IsaacError, Result};
use crate::network::ConnInfo;
use crate::state::SuffrageExpelOperation;
use crate::storage::StorageError;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

const EVENT_BUFFER: usize = 64;
const TIMER_BUFFER: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateType {
    Stopped,
    Booting,
    Joining,
    Consensus,
    Syncing,
    Handover,
    Broken,
}

impl StateType {
    pub fn as_str(self) -> &'static str {
        match self {
            StateType::Stopped => "STOPPED",
            StateType::Booting => "BOOTING",
            StateType::Joining => "JOINING",
            StateType::Consensus => "CONSENSUS",
            StateType::Syncing => "SYNCING",
            StateType::Handover => "HANDOVER",
            StateType::Broken => "BROKEN",
        }
    }
}

impl fmt::Display for StateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A switch request and what the next handler starts from.
#[derive(Clone, Debug)]
pub enum SwitchContext {
    Booting,
    Joining,
    /// The voteproof that moved the node into consensus.
    Consensus(Voteproof),
    /// Sync up to this height.
    Syncing(Height),
    Handover,
    Broken(String),
    Stopped,
}

impl SwitchContext {
    pub fn state_type(&self) -> StateType {
        match self {
            SwitchContext::Booting => StateType::Booting,
            SwitchContext::Joining => StateType::Joining,
            SwitchContext::Consensus(_) => StateType::Consensus,
            SwitchContext::Syncing(_) => StateType::Syncing,
            SwitchContext::Handover => StateType::Handover,
            SwitchContext::Broken(_) => StateType::Broken,
            SwitchContext::Stopped => StateType::Stopped,
        }
    }

    /// Where a node that saw `vp` ahead of its tip should sync to.
    pub fn sync_to(vp: &Voteproof) -> SwitchContext {
        let target = if vp.accept_majority().is_some() {
            vp.height()
        } else {
            vp.height().prev()
        };
        SwitchContext::Syncing(target)
    }
}

#[derive(Debug)]
pub enum Transition {
    Stay,
    Switch(SwitchContext),
}

/// What a handler needs to build and send its INIT ballot once the
/// proposal is known.
#[derive(Clone, Debug)]
pub struct InitRequest {
    pub point: Point,
    pub previous_block: Hash,
    pub voteproof: Option<Voteproof>,
    pub expels: Vec<SuffrageExpelOperation>,
}

/// Results of work handlers spawned, plus external commands.
pub enum Event {
    ProposalSelected(InitRequest, Result<ProposalSignFact>),
    Processed {
        point: Point,
        result: std::result::Result<Manifest, ProcessorError>,
    },
    Saved {
        point: Point,
        result: std::result::Result<BlockMap, ProcessorError>,
    },
    SyncDone(std::result::Result<Height, SyncError>),
    StartHandover,
    FinishHandover,
    Stop,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ProposalSelected(req, r) => write!(f, "ProposalSelected({}, ok={})", req.point, r.is_ok()),
            Event::Processed { point, result } => write!(f, "Processed({point}, ok={})", result.is_ok()),
            Event::Saved { point, result } => write!(f, "Saved({point}, ok={})", result.is_ok()),
            Event::SyncDone(r) => write!(f, "SyncDone(ok={})", r.is_ok()),
            Event::StartHandover => f.write_str("StartHandover"),
            Event::FinishHandover => f.write_str("FinishHandover"),
            Event::Stop => f.write_str("Stop"),
        }
    }
}

/// Long-lived parts shared by every handler.
pub struct ConsensusContext {
    pub args: NodeArgs,
    pub ballotbox: Arc<Ballotbox>,
    pub queue: Arc<BallotQueue>,
    pub broadcaster: Broadcaster,
    pub maker: Arc<ProposalMaker>,
    pub proposals: ProposalSelector,
    pub processors: ProposalProcessors,
    pub sync_sources: Arc<SyncSourcePool>,
    pub syncer: Syncer,
}

impl ConsensusContext {
    /// Wires the consensus parts over `args`; the receiver carries the
    /// ballotbox's voteproofs to the driver.
    pub fn build(args: NodeArgs, sync_sources: Vec<ConnInfo>) -> (Arc<Self>, mpsc::Receiver<Voteproof>) {
        let params = &args.params;
        let (ballotbox, voteproofs) = Ballotbox::new(
            args.network_id.clone(),
            params.threshold,
            params.ballot_valid_window,
            Arc::new(DatabaseSuffrage(Arc::clone(&args.db))),
            params.ballotbox_voteproof_buffer,
        );
        let queue = Arc::new(BallotQueue::new(params.inbound_ballot_queue));
        let broadcaster = Broadcaster::new(
            args.local.address().clone(),
            Arc::clone(&args.client),
            args.peers.clone(),
            Arc::clone(&queue),
            params.timeout_request,
        );
        let maker = Arc::new(ProposalMaker::new(
            args.local.clone(),
            args.network_id.clone(),
            Arc::clone(&args.db),
            Arc::clone(&args.pool),
        ));
        let sync_sources = Arc::new(SyncSourcePool::new(sync_sources, params.sync_source_renew_timeout));
        let syncer = Syncer::new(
            args.network_id.clone(),
            params.clone(),
            Arc::clone(&args.db),
            args.block_root.clone(),
            Arc::clone(&args.client),
            Arc::clone(&sync_sources),
        );

        let ctx = ConsensusContext {
            proposals: ProposalSelector::new(args.clone(), Arc::clone(&maker)),
            processors: ProposalProcessors::new(args.clone()),
            ballotbox: Arc::new(ballotbox),
            queue,
            broadcaster,
            maker,
            sync_sources,
            syncer,
            args,
        };
        (Arc::new(ctx), voteproofs)
    }

    pub fn last_blockmap(&self) -> Result<BlockMap> {
        Ok(self
            .args
            .db
            .last_blockmap()?
            .ok_or_else(|| StorageError::NotFound("last block map".to_string()))?)
    }

    pub fn suffrage(&self, height: Height) -> Result<Option<Suffrage>> {
        Ok(self.args.db.suffrage(height)?)
    }

    /// Whether the local node votes at `height`.
    pub fn is_member(&self, height: Height) -> Result<bool> {
        let local = &self.args.local;
        Ok(self
            .suffrage(height)?
            .is_some_and(|s| s.exists_publickey(local.address(), &local.publickey())))
    }
}

/// Per-driver state handed to the active handler.
pub struct HandlerContext {
    pub ctx: Arc<ConsensusContext>,
    pub timers: Timers,
    pub last_voteproofs: LastVoteproofs,
    events: mpsc::Sender<Event>,
}

impl HandlerContext {
    /// Runs `fut` detached and delivers its event to the driver.
    pub fn spawn_event<F>(&self, fut: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let ev = fut.await;
            if events.send(ev).await.is_err() {
                debug!("state driver gone, event dropped");
            }
        });
    }

    /// Selects the proposal for `req` in the background.
    pub fn request_init_ballot(&self, req: InitRequest) {
        let ctx = Arc::clone(&self.ctx);
        self.spawn_event(async move {
            let result = ctx.proposals.select(req.point, req.previous_block).await;
            Event::ProposalSelected(req, result)
        });
    }

    /// Builds the INIT ballot for a selected proposal and sends it to the
    /// local ballotbox and the peers. Without a proposal the ballot votes
    /// for [`unavailable_proposal`], so the point can only move on to the
    /// next round.
    pub fn broadcast_init(&mut self, req: &InitRequest, proposal: Result<ProposalSignFact>) -> Result<Ballot> {
        let proposal = match proposal {
            Ok(pr) => pr.hash(),
            Err(e) if e.kind() == ErrorKind::Broken => return Err(e),
            Err(e) => {
                warn!(point = %req.point, error = %e, "no proposal from proposer, voting for next round");
                unavailable_proposal(req.point, &req.previous_block)
            }
        };
        let args = &self.ctx.args;
        let ballot = Ballot::init(
            &args.local,
            &args.network_id,
            req.point,
            req.previous_block,
            proposal,
            req.voteproof.clone(),
            req.expels.clone(),
        );
        self.start_ballot(ballot.clone(), TimerId::BroadcastInitBallot);
        Ok(ballot)
    }

    /// Sends `ballot` and arms its resend and stuck timers.
    pub fn start_ballot(&mut self, ballot: Ballot, resend: TimerId) {
        let params = &self.ctx.args.params;
        let interval = params.interval_broadcast_ballot;
        let stuck = params.ballot_stuck_wait;

        self.ctx.broadcaster.broadcast(ballot, true);
        self.timers.stop(TimerId::BroadcastInitBallot);
        self.timers.stop(TimerId::BroadcastAcceptBallot);
        self.timers.stop(TimerId::StuckResolve);
        self.timers.start(resend, interval, Some(interval));
        self.timers.start(TimerId::StuckBallot, stuck, None);
    }
}

#[async_trait]
pub trait Handler: Send {
    fn state_type(&self) -> StateType;

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, sctx: SwitchContext) -> Result<Transition>;

    async fn exit(&mut self, _hc: &mut HandlerContext) {}

    async fn new_voteproof(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition>;

    async fn on_timer(&mut self, _hc: &mut HandlerContext, _id: TimerId) -> Result<Transition> {
        Ok(Transition::Stay)
    }

    async fn on_event(&mut self, _hc: &mut HandlerContext, _event: Event) -> Result<Transition> {
        Ok(Transition::Stay)
    }
}

fn new_handler(state: StateType) -> Box<dyn Handler> {
    match state {
        StateType::Stopped => Box::new(StoppedHandler),
        StateType::Booting => Box::new(BootingHandler),
        StateType::Joining => Box::<JoiningHandler>::default(),
        StateType::Consensus => Box::<ConsensusHandler>::default(),
        StateType::Syncing => Box::<SyncingHandler>::default(),
        StateType::Handover => Box::new(HandoverHandler),
        StateType::Broken => Box::new(BrokenHandler),
    }
}

/// Control handle of a running driver.
#[derive(Clone)]
pub struct States {
    events: mpsc::Sender<Event>,
    state: watch::Receiver<StateType>,
    last_error: watch::Receiver<Option<String>>,
}

impl States {
    pub fn state(&self) -> StateType {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateType> {
        self.state.clone()
    }

    /// Why the node went broken, once it has.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    async fn send(&self, ev: Event) {
        if self.events.send(ev).await.is_err() {
            debug!("state driver already finished");
        }
    }

    pub async fn stop(&self) {
        self.send(Event::Stop).await;
    }

    pub async fn start_handover(&self) {
        self.send(Event::StartHandover).await;
    }

    pub async fn finish_handover(&self) {
        self.send(Event::FinishHandover).await;
    }

    /// Waits until the state is `want`; false when the driver finished
    /// first.
    pub async fn wait_for(&mut self, want: StateType) -> bool {
        self.state.wait_for(|s| *s == want).await.is_ok()
    }
}

pub struct StateDriver {
    hc: HandlerContext,
    handler: Box<dyn Handler>,
    voteproofs: mpsc::Receiver<Voteproof>,
    ticks: mpsc::Receiver<TimerTick>,
    events: mpsc::Receiver<Event>,
    state: watch::Sender<StateType>,
    last_error: watch::Sender<Option<String>>,
}

impl StateDriver {
    pub fn new(ctx: Arc<ConsensusContext>, voteproofs: mpsc::Receiver<Voteproof>) -> (Self, States) {
        let (ticks_tx, ticks) = mpsc::channel(TIMER_BUFFER);
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (state, state_rx) = watch::channel(StateType::Stopped);
        let (last_error, last_error_rx) = watch::channel(None);

        let driver = StateDriver {
            hc: HandlerContext {
                ctx,
                timers: Timers::new(ticks_tx),
                last_voteproofs: LastVoteproofs::default(),
                events: events_tx.clone(),
            },
            handler: Box::new(StoppedHandler),
            voteproofs,
            ticks,
            events,
            state,
            last_error,
        };
        let states = States {
            events: events_tx,
            state: state_rx,
            last_error: last_error_rx,
        };
        (driver, states)
    }

    pub fn current(&self) -> StateType {
        self.handler.state_type()
    }

    /// Boots the node and runs until it is stopped. Returns the last state.
    pub async fn run(mut self) -> StateType {
        self.switch(SwitchContext::Booting, true).await;

        loop {
            if self.current() == StateType::Stopped {
                break;
            }
            let result = tokio::select! {
                Some(vp) = self.voteproofs.recv() => self.on_voteproof(vp).await,
                Some(tick) = self.ticks.recv() => {
                    if !self.hc.timers.is_current(tick) {
                        trace!(timer = %tick.id, "stale timer tick");
                        continue;
                    }
                    self.handler.on_timer(&mut self.hc, tick.id).await
                }
                Some(ev) = self.events.recv() => self.on_event(ev).await,
                else => break,
            };
            self.apply(result).await;
        }

        self.hc.timers.stop_all();
        self.current()
    }

    async fn on_voteproof(&mut self, vp: Voteproof) -> Result<Transition> {
        if !self.hc.last_voteproofs.is_new(&vp) {
            trace!(stagepoint = %vp.point(), "old voteproof ignored");
            return Ok(Transition::Stay);
        }
        self.hc.last_voteproofs.set(&vp);
        debug!(
            state = %self.current(),
            stagepoint = %vp.point(),
            result = %vp.result(),
            "new voteproof"
        );
        self.handler.new_voteproof(&mut self.hc, vp).await
    }

    async fn on_event(&mut self, ev: Event) -> Result<Transition> {
        trace!(event = ?ev, state = %self.current(), "event");
        match ev {
            Event::Stop => Ok(Transition::Switch(SwitchContext::Stopped)),
            Event::StartHandover => match self.current() {
                StateType::Joining | StateType::Consensus | StateType::Syncing => {
                    Ok(Transition::Switch(SwitchContext::Handover))
                }
                s => {
                    warn!(state = %s, "handover ignored");
                    Ok(Transition::Stay)
                }
            },
            ev => self.handler.on_event(&mut self.hc, ev).await,
        }
    }

    async fn apply(&mut self, result: Result<Transition>) {
        if let Some(next) = self.resolve(result) {
            self.switch(next, false).await;
        }
    }

    /// Turns a handler result into the switch it implies.
    fn resolve(&self, result: Result<Transition>) -> Option<SwitchContext> {
        match result {
            Ok(Transition::Stay) => None,
            Ok(Transition::Switch(next)) => Some(next),
            Err(e) => self.on_error(e),
        }
    }

    fn on_error(&self, err: IsaacError) -> Option<SwitchContext> {
        let state = self.current();
        if err.kind() == ErrorKind::Broken {
            error!(state = %state, error = %err, "unrecoverable error");
            return Some(SwitchContext::Broken(err.to_string()));
        }
        match state {
            StateType::Consensus => {
                warn!(error = %err, "consensus failed, rejoining");
                Some(SwitchContext::Joining)
            }
            StateType::Booting => Some(SwitchContext::Broken(err.to_string())),
            _ => {
                warn!(state = %state, error = %err, "handler error");
                None
            }
        }
    }

    async fn switch(&mut self, mut next: SwitchContext, force: bool) {
        loop {
            let from = self.current();
            let to = next.state_type();
            if from == StateType::Stopped && !force {
                return;
            }

            self.handler.exit(&mut self.hc).await;
            self.hc.timers.stop_all();
            self.handler = new_handler(to);
            if let SwitchContext::Broken(reason) = &next {
                self.last_error.send_replace(Some(reason.clone()));
            }
            self.state.send_replace(to);
            info!(from = %from, to = %to, "state switched");

            let result = self.handler.enter(&mut self.hc, from, next).await;
            match self.resolve(result) {
                Some(again) => next = again,
                None => return,
            }
        }
    }
}
