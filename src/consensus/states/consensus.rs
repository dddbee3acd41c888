//! INIT and ACCEPT rounds at the height above the local tip.
//!
//! An INIT majority starts processing its proposal; when processing ends
//! the node votes ACCEPT for the resulting block. An ACCEPT majority that
//! agrees with the processed block saves it and opens the next height. A
//! draw at either stage, or a stuck round resolved by expelling silent
//! members, moves to the next round.

use super::{Event, Handler, HandlerContext, InitRequest, StateType, SwitchContext, Transition};
use crate::base::{Hash, Height, Point, Round, Stage};
use crate::block::{BlockMap, Manifest};
use crate::consensus::voteproof::next_point;
use crate::consensus::{network_policy, unavailable_proposal, Ballot, BallotFact, ProcessorError, TimerId, Voteproof};
use crate::error::{ErrorKind, IsaacError, Result};
use crate::state::{SuffrageExpelFact, SuffrageExpelOperation};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

const STUCK_EXPEL_REASON: &str = "no ballot in stuck round";

#[derive(Default)]
pub(crate) struct ConsensusHandler {
    /// Point whose INIT ballot waits for its proposal.
    expected_init: Option<Point>,
    /// Last ballot sent; resent by the broadcast timers.
    ballot: Option<Ballot>,
    /// INIT majority whose proposal is being processed.
    processing: Option<Voteproof>,
    processed: Option<(Point, Manifest)>,
    /// ACCEPT majority that arrived before processing finished.
    pending_accept: Option<Voteproof>,
    saving: Option<Voteproof>,
    /// Voteproof of the height above the block being saved; handled once
    /// the save finishes.
    deferred: Option<Voteproof>,
    /// Draw waiting for the next round.
    next_round: Option<Voteproof>,
}

impl ConsensusHandler {
    async fn handle(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition> {
        let tip = hc.ctx.last_blockmap()?;
        let expected = tip.height().next();

        if vp.height() < expected {
            debug!(stagepoint = %vp.point(), tip = %tip.height(), "voteproof below tip ignored");
            return Ok(Transition::Stay);
        }
        if vp.height() == expected.next() && self.saving.as_ref().is_some_and(|s| s.height() == expected) {
            debug!(stagepoint = %vp.point(), "voteproof waits for the block being saved");
            if self.deferred.as_ref().map_or(true, |d| d.point() < vp.point()) {
                self.deferred = Some(vp);
            }
            return Ok(Transition::Stay);
        }
        if vp.height() > expected {
            info!(stagepoint = %vp.point(), tip = %tip.height(), "voteproof ahead of tip");
            hc.ctx.processors.cancel();
            return Ok(Transition::Switch(SwitchContext::sync_to(&vp)));
        }

        match vp.stage() {
            Stage::Init => self.on_init(hc, vp, &tip),
            _ => self.on_accept(hc, vp),
        }
    }

    fn on_init(&mut self, hc: &mut HandlerContext, vp: Voteproof, tip: &BlockMap) -> Result<Transition> {
        hc.timers.stop(TimerId::BroadcastInitBallot);
        hc.timers.stop(TimerId::StuckBallot);
        hc.timers.stop(TimerId::StuckResolve);
        self.expected_init = None;
        self.processed = None;
        self.pending_accept = None;

        let Some(fact) = vp.init_majority().cloned() else {
            self.processing = None;
            return Ok(self.schedule_next_round(hc, vp));
        };
        if fact.previous_block != tip.manifest.hash {
            warn!(
                expected = %tip.manifest.hash,
                found = %fact.previous_block,
                "INIT majority builds on another block"
            );
            hc.ctx.processors.cancel();
            return Ok(Transition::Switch(SwitchContext::sync_to(&vp)));
        }

        let point = vp.point().point;
        if fact.proposal == unavailable_proposal(point, &fact.previous_block) {
            info!(point = %point, "INIT majority without proposal");
            self.processing = None;
            return Ok(self.schedule_next_round(hc, vp));
        }
        self.processing = Some(vp.clone());
        let ctx = Arc::clone(&hc.ctx);
        let previous = tip.manifest.clone();
        hc.spawn_event(async move {
            let result = async {
                let proposer = ctx.proposals.proposer(point, &fact.previous_block).ok();
                let proposal = ctx
                    .proposals
                    .fetch(&fact.proposal, proposer.as_ref())
                    .await
                    .map_err(|e| ProcessorError::Retry(e.to_string()))?;
                ctx.processors.process(proposal, previous, vp).await
            }
            .await;
            Event::Processed { point, result }
        });
        Ok(Transition::Stay)
    }

    fn on_accept(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition> {
        hc.timers.stop(TimerId::BroadcastAcceptBallot);
        hc.timers.stop(TimerId::StuckBallot);
        hc.timers.stop(TimerId::StuckResolve);

        let point = vp.point().point;
        let Some(fact) = vp.accept_majority().cloned() else {
            hc.ctx.processors.cancel();
            self.processing = None;
            self.processed = None;
            return Ok(self.schedule_next_round(hc, vp));
        };

        let processed = self
            .processed
            .as_ref()
            .filter(|(p, _)| *p == point)
            .map(|(_, m)| m.hash);
        match processed {
            Some(block) if block == fact.new_block => {
                self.save(hc, vp);
                return Ok(Transition::Stay);
            }
            Some(block) => warn!(
                processed = %block,
                accepted = %fact.new_block,
                "ACCEPT majority for another block"
            ),
            None if self.processing.as_ref().is_some_and(|i| i.point().point == point) => {
                debug!(point = %point, "ACCEPT majority before processing finished");
                self.pending_accept = Some(vp);
                return Ok(Transition::Stay);
            }
            None => warn!(point = %point, "ACCEPT majority without processed block"),
        }

        hc.ctx.processors.cancel();
        self.processing = None;
        self.processed = None;
        Ok(Transition::Switch(SwitchContext::Syncing(vp.height())))
    }

    fn save(&mut self, hc: &mut HandlerContext, vp: Voteproof) {
        let point = vp.point().point;
        self.saving = Some(vp.clone());
        let ctx = Arc::clone(&hc.ctx);
        hc.spawn_event(async move {
            let result = ctx.processors.save(vp).await;
            Event::Saved { point, result }
        });
    }

    fn schedule_next_round(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Transition {
        debug!(stagepoint = %vp.point(), stuck = vp.is_stuck(), "round drawn, preparing next round");
        self.next_round = Some(vp);
        let wait = hc.ctx.args.params.wait_preparing_init_ballot;
        hc.timers.start(TimerId::PrepareNextRound, wait, None);
        Transition::Stay
    }

    fn prepare_init(&mut self, hc: &mut HandlerContext, req: InitRequest) -> Result<Transition> {
        if !hc.ctx.is_member(req.point.height)? {
            debug!(point = %req.point, "not in suffrage, no INIT ballot");
            self.expected_init = None;
            return Ok(Transition::Stay);
        }
        self.expected_init = Some(req.point);
        hc.request_init_ballot(req);
        Ok(Transition::Stay)
    }

    fn next_round(&mut self, hc: &mut HandlerContext) -> Result<Transition> {
        let Some(vp) = self.next_round.take() else {
            return Ok(Transition::Stay);
        };
        let previous_block = match hc.last_voteproofs.previous_block_for_next_round(&vp) {
            Some(h) => h,
            None => hc.ctx.last_blockmap()?.manifest.hash,
        };
        let req = InitRequest {
            point: next_point(&vp),
            previous_block,
            expels: vp.expels().to_vec(),
            voteproof: Some(vp),
        };
        self.prepare_init(hc, req)
    }

    fn on_processed(
        &mut self,
        hc: &mut HandlerContext,
        point: Point,
        result: std::result::Result<Manifest, ProcessorError>,
    ) -> Result<Transition> {
        let Some(init) = self.processing.clone().filter(|vp| vp.point().point == point) else {
            debug!(point = %point, "stale process result");
            return Ok(Transition::Stay);
        };

        let manifest = match result {
            Ok(m) => m,
            Err(ProcessorError::Canceled) => return Ok(Transition::Stay),
            Err(e) if e.kind() == ErrorKind::IgnoreProposalProcessor => {
                info!(point = %point, reason = %e, "processing ignored");
                return Ok(Transition::Stay);
            }
            Err(e) if e.kind() == ErrorKind::Invalid => {
                warn!(point = %point, error = %e, "invalid proposal, moving to next round");
                self.processing = None;
                self.pending_accept = None;
                return Ok(self.schedule_next_round(hc, init));
            }
            Err(e) => return Err(e.into()),
        };
        self.processed = Some((point, manifest.clone()));

        if let Some(accept) = self.pending_accept.take() {
            return self.on_accept(hc, accept);
        }
        if !hc.ctx.is_member(point.height)? {
            return Ok(Transition::Stay);
        }

        let proposal = init
            .init_majority()
            .map(|f| f.proposal)
            .ok_or_else(|| IsaacError::Other("processing without INIT majority".to_string()))?;
        let args = &hc.ctx.args;
        let ballot = Ballot::accept(
            &args.local,
            &args.network_id,
            point,
            proposal,
            manifest.hash,
            init.clone(),
            init.expels().to_vec(),
        );
        hc.start_ballot(ballot.clone(), TimerId::BroadcastAcceptBallot);
        self.ballot = Some(ballot);
        Ok(Transition::Stay)
    }

    async fn on_saved(
        &mut self,
        hc: &mut HandlerContext,
        point: Point,
        result: std::result::Result<BlockMap, ProcessorError>,
    ) -> Result<Transition> {
        let Some(accept) = self.saving.take().filter(|vp| vp.point().point == point) else {
            return Ok(Transition::Stay);
        };
        self.processing = None;
        self.processed = None;
        let deferred = self.deferred.take();
        let blockmap = result?;

        let pool = &hc.ctx.args.pool;
        let proposal = match blockmap.manifest.proposal {
            Some(h) => pool.proposal(&h)?,
            None => None,
        };
        if let Some(proposal) = proposal {
            let facts: Vec<Hash> = proposal.fact.operations.iter().map(|o| o.fact).collect();
            let removed = pool.remove_operations(&facts)?;
            debug!(removed, "committed operations removed from pool");
        }
        pool.clean_proposals(blockmap.height().next())?;

        let t = self.prepare_init(
            hc,
            InitRequest {
                point: Point::new(blockmap.height().next(), Round::ZERO),
                previous_block: blockmap.manifest.hash,
                voteproof: Some(accept),
                expels: Vec::new(),
            },
        )?;
        match (t, deferred) {
            (Transition::Stay, Some(vp)) => self.handle(hc, vp).await,
            (t, _) => Ok(t),
        }
    }

    /// Re-sends the current ballot proposing to expel the members that
    /// have not voted at its stagepoint.
    fn on_stuck(&mut self, hc: &mut HandlerContext) -> Result<Transition> {
        let Some(ballot) = &self.ballot else {
            return Ok(Transition::Stay);
        };
        let sp = ballot.stagepoint();
        let args = &hc.ctx.args;
        let missing: Vec<_> = hc
            .ctx
            .ballotbox
            .missing_nodes(sp)
            .unwrap_or_default()
            .into_iter()
            .filter(|n| n != args.local.address())
            .collect();
        if missing.is_empty() {
            return Ok(Transition::Stay);
        }

        let policy = network_policy(args.db.as_ref())?;
        let start = sp.height();
        let end = Height::new(start.get().saturating_add(policy.suffrage_expel_lifespan as i64));
        let expels: Vec<SuffrageExpelOperation> = missing
            .iter()
            .map(|node| {
                SuffrageExpelOperation::new(
                    SuffrageExpelFact::new(node.clone(), start, end, STUCK_EXPEL_REASON),
                    &args.local,
                    &args.network_id,
                )
            })
            .collect();

        let rebuilt = match (ballot.fact(), ballot.voteproof.clone()) {
            (BallotFact::Init(f), vp) => Some(Ballot::init(
                &args.local,
                &args.network_id,
                f.point,
                f.previous_block,
                f.proposal,
                vp,
                expels,
            )),
            (BallotFact::Accept(f), Some(vp)) => Some(Ballot::accept(
                &args.local,
                &args.network_id,
                f.point,
                f.proposal,
                f.new_block,
                vp,
                expels,
            )),
            _ => None,
        };
        let Some(rebuilt) = rebuilt else {
            return Ok(Transition::Stay);
        };

        warn!(stagepoint = %sp, missing = ?missing, "ballots stuck, proposing expels");
        hc.ctx.broadcaster.broadcast(rebuilt.clone(), true);
        self.ballot = Some(rebuilt);

        let params = &hc.ctx.args.params;
        let resolve = params.ballot_stuck_resolve_after.saturating_sub(params.ballot_stuck_wait);
        hc.timers.start(TimerId::StuckResolve, resolve, None);
        Ok(Transition::Stay)
    }
}

#[async_trait]
impl Handler for ConsensusHandler {
    fn state_type(&self) -> StateType {
        StateType::Consensus
    }

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, sctx: SwitchContext) -> Result<Transition> {
        let SwitchContext::Consensus(vp) = sctx else {
            return Err(IsaacError::Other("consensus entered without voteproof".to_string()));
        };
        info!(from = %from, stagepoint = %vp.point(), "consensus started");
        self.handle(hc, vp).await
    }

    async fn exit(&mut self, hc: &mut HandlerContext) {
        if self.saving.is_none() {
            hc.ctx.processors.cancel();
        }
    }

    async fn new_voteproof(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition> {
        self.handle(hc, vp).await
    }

    async fn on_timer(&mut self, hc: &mut HandlerContext, id: TimerId) -> Result<Transition> {
        match id {
            TimerId::BroadcastInitBallot | TimerId::BroadcastAcceptBallot => {
                if let Some(ballot) = &self.ballot {
                    hc.ctx.broadcaster.broadcast(ballot.clone(), false);
                }
                Ok(Transition::Stay)
            }
            TimerId::PrepareNextRound => self.next_round(hc),
            TimerId::StuckBallot => self.on_stuck(hc),
            TimerId::StuckResolve => {
                let Some(sp) = self.ballot.as_ref().map(|b| b.stagepoint()) else {
                    return Ok(Transition::Stay);
                };
                // The voteproof, when there is one, comes back through the
                // ballotbox channel.
                if hc.ctx.ballotbox.stuck_voteproof(sp).await.is_none() {
                    debug!(stagepoint = %sp, "stuck round not resolvable yet");
                    let wait = hc.ctx.args.params.ballot_stuck_wait;
                    hc.timers.start(TimerId::StuckBallot, wait, None);
                }
                Ok(Transition::Stay)
            }
        }
    }

    async fn on_event(&mut self, hc: &mut HandlerContext, event: Event) -> Result<Transition> {
        match event {
            Event::ProposalSelected(req, result) => {
                if self.expected_init != Some(req.point) {
                    return Ok(Transition::Stay);
                }
                self.expected_init = None;
                self.ballot = Some(hc.broadcast_init(&req, result)?);
                Ok(Transition::Stay)
            }
            Event::Processed { point, result } => self.on_processed(hc, point, result),
            Event::Saved { point, result } => self.on_saved(hc, point, result).await,
            _ => Ok(Transition::Stay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::LocalNode;
    use crate::consensus::tests::{init_logging, key_value, local, majority, test_params, TestNode};
    use crate::consensus::timers::Timers;
    use crate::consensus::{AcceptBallotFact, InitBallotFact, LastVoteproofs};
    use crate::network::LocalNetwork;
    use crate::state::key_value_state_key;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        node: TestNode,
        hc: HandlerContext,
        events: mpsc::Receiver<Event>,
        genesis: BlockMap,
        _ticks: mpsc::Receiver<crate::consensus::timers::TimerTick>,
    }

    fn fixture(a: &LocalNode) -> Fixture {
        let network = Arc::new(LocalNetwork::new());
        let node = TestNode::new(a.clone(), test_params(100.0), &network, vec![], vec![]);
        let genesis = node.genesis(&[a]);
        node.args.pool.set_operation(key_value(a, "k", "v")).unwrap();

        let (ticks_tx, ticks) = mpsc::channel(16);
        let (events_tx, events) = mpsc::channel(16);
        let hc = HandlerContext {
            ctx: Arc::clone(&node.ctx),
            timers: Timers::new(ticks_tx),
            last_voteproofs: LastVoteproofs::default(),
            events: events_tx,
        };
        Fixture {
            node,
            hc,
            events,
            genesis,
            _ticks: ticks,
        }
    }

    /// INIT majority at (1, 0) over a fresh proposal from the pool.
    fn init_voteproof(f: &Fixture, a: &LocalNode) -> (Voteproof, Hash) {
        let point = Point::new(Height::new(1), Round::ZERO);
        let proposal = f.node.ctx.maker.make(point, f.genesis.manifest.hash).unwrap();
        let fact = BallotFact::Init(InitBallotFact::new(point, f.genesis.manifest.hash, proposal.hash(), vec![]));
        (majority(a, fact), proposal.hash())
    }

    fn accept_voteproof(a: &LocalNode, proposal: Hash, new_block: Hash) -> Voteproof {
        let point = Point::new(Height::new(1), Round::ZERO);
        majority(a, BallotFact::Accept(AcceptBallotFact::new(point, proposal, new_block, vec![])))
    }

    async fn next_event(events: &mut mpsc::Receiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_block_accepted_while_processing_switches_to_syncing() {
        init_logging();
        let a = local("a");
        let mut f = fixture(&a);
        let (init, proposal) = init_voteproof(&f, &a);
        let mut handler = ConsensusHandler::default();

        let t = handler.new_voteproof(&mut f.hc, init).await.unwrap();
        assert!(matches!(t, Transition::Stay));

        let other = accept_voteproof(&a, proposal, Hash::digest(b"other block"));
        let t = handler.new_voteproof(&mut f.hc, other).await.unwrap();
        assert!(matches!(t, Transition::Stay));
        assert!(handler.pending_accept.is_some());

        let ev = next_event(&mut f.events).await;
        assert!(matches!(ev, Event::Processed { result: Ok(_), .. }));
        let t = handler.on_event(&mut f.hc, ev).await.unwrap();
        assert!(matches!(t, Transition::Switch(SwitchContext::Syncing(h)) if h == Height::new(1)));

        assert!(f.node.ctx.processors.current().is_none());
        assert_eq!(f.node.tip(), Height::GENESIS);
        assert!(f.node.args.db.state(&key_value_state_key("k")).unwrap().is_none());
        assert!(f.node.args.db.voteproofs(Height::new(1)).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn matching_accept_saves_and_opens_next_height() {
        init_logging();
        let a = local("a");
        let mut f = fixture(&a);
        let (init, proposal) = init_voteproof(&f, &a);
        let mut handler = ConsensusHandler::default();

        handler.new_voteproof(&mut f.hc, init).await.unwrap();
        let ev = next_event(&mut f.events).await;
        let manifest = match &ev {
            Event::Processed { result: Ok(m), .. } => m.clone(),
            other => panic!("unexpected event {other:?}"),
        };
        handler.on_event(&mut f.hc, ev).await.unwrap();
        assert!(f.hc.timers.is_running(TimerId::BroadcastAcceptBallot));
        assert!(matches!(
            handler.ballot.as_ref().map(|b| b.fact()),
            Some(BallotFact::Accept(fact)) if fact.new_block == manifest.hash
        ));

        let committed = f.node.args.pool.proposal(&proposal).unwrap().unwrap();
        assert_eq!(committed.fact.operations.len(), 1);

        let accept = accept_voteproof(&a, proposal, manifest.hash);
        handler.new_voteproof(&mut f.hc, accept).await.unwrap();
        let ev = next_event(&mut f.events).await;
        assert!(matches!(ev, Event::Saved { result: Ok(_), .. }));
        let t = handler.on_event(&mut f.hc, ev).await.unwrap();
        assert!(matches!(t, Transition::Stay));

        assert_eq!(f.node.tip(), Height::new(1));
        for po in &committed.fact.operations {
            assert!(f.node.args.pool.operation(&po.operation).unwrap().is_none());
        }
        assert_eq!(f.node.blockmap(Height::new(1)).manifest, manifest);
        assert!(f.node.args.db.state(&key_value_state_key("k")).unwrap().is_some());
        assert_eq!(handler.expected_init, Some(Point::new(Height::new(2), Round::ZERO)));

        match next_event(&mut f.events).await {
            Event::ProposalSelected(req, Ok(pr)) => {
                assert_eq!(req.point, Point::new(Height::new(2), Round::ZERO));
                assert_eq!(pr.fact.previous_block, manifest.hash);
                assert!(pr.fact.operations.is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn next_height_voteproof_waits_for_save() {
        init_logging();
        let a = local("a");
        let mut f = fixture(&a);
        let (init, proposal) = init_voteproof(&f, &a);
        let mut handler = ConsensusHandler::default();

        handler.new_voteproof(&mut f.hc, init).await.unwrap();
        let ev = next_event(&mut f.events).await;
        let manifest = match &ev {
            Event::Processed { result: Ok(m), .. } => m.clone(),
            other => panic!("unexpected event {other:?}"),
        };
        handler.on_event(&mut f.hc, ev).await.unwrap();
        handler
            .new_voteproof(&mut f.hc, accept_voteproof(&a, proposal, manifest.hash))
            .await
            .unwrap();
        assert!(handler.saving.is_some());

        // Others already agreed on the next height before the local save
        // finished.
        let next = Point::new(Height::new(2), Round::ZERO);
        let next_proposal = f.node.ctx.maker.make(next, manifest.hash).unwrap();
        let fact = BallotFact::Init(InitBallotFact::new(next, manifest.hash, next_proposal.hash(), vec![]));
        let t = handler.new_voteproof(&mut f.hc, majority(&a, fact)).await.unwrap();
        assert!(matches!(t, Transition::Stay));
        assert!(handler.deferred.is_some());

        let ev = next_event(&mut f.events).await;
        assert!(matches!(ev, Event::Saved { result: Ok(_), .. }));
        let t = handler.on_event(&mut f.hc, ev).await.unwrap();
        assert!(matches!(t, Transition::Stay));

        assert_eq!(f.node.tip(), Height::new(1));
        assert_eq!(f.node.blockmap(Height::new(1)).manifest, manifest);
        assert!(handler.deferred.is_none());
        assert_eq!(handler.processing.as_ref().map(|vp| vp.point().point), Some(next));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn draw_waits_then_votes_next_round() {
        init_logging();
        let a = local("a");
        let mut f = fixture(&a);
        let point = Point::new(Height::new(1), Round::ZERO);
        let fact = BallotFact::Init(InitBallotFact::new(point, f.genesis.manifest.hash, Hash::digest(b"p"), vec![]));
        let draw = Voteproof::finish(
            crate::base::StagePoint::new(point, Stage::Init),
            crate::base::VoteResult::Draw,
            crate::base::Threshold::MAX,
            vec![crate::consensus::BallotSignFact::new(&a, &f.node.args.network_id, fact)],
            None,
            vec![],
        );
        f.hc.last_voteproofs.set(&draw);

        let mut handler = ConsensusHandler::default();
        handler.new_voteproof(&mut f.hc, draw).await.unwrap();
        assert!(f.hc.timers.is_running(TimerId::PrepareNextRound));

        handler.on_timer(&mut f.hc, TimerId::PrepareNextRound).await.unwrap();
        let next = Point::new(Height::new(1), Round::new(1));
        assert_eq!(handler.expected_init, Some(next));

        match next_event(&mut f.events).await {
            Event::ProposalSelected(req, Ok(_)) => {
                assert_eq!(req.point, next);
                assert_eq!(req.previous_block, f.genesis.manifest.hash);
                assert!(req.voteproof.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
