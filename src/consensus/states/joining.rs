use super::{Event, Handler, HandlerContext, InitRequest, StateType, SwitchContext, Transition};
use crate::base::{Point, Round, Stage};
use crate::consensus::{Ballot, TimerId, Voteproof};
use crate::error::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Waits for the network's next voteproof above the local tip. Suffrage
/// members announce themselves with an INIT ballot for the next height.
#[derive(Default)]
pub(crate) struct JoiningHandler {
    expected: Option<Point>,
    ballot: Option<Ballot>,
}

#[async_trait]
impl Handler for JoiningHandler {
    fn state_type(&self) -> StateType {
        StateType::Joining
    }

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, _sctx: SwitchContext) -> Result<Transition> {
        let ctx = &hc.ctx;
        let tip = ctx.last_blockmap()?;
        let point = Point::new(tip.height().next(), Round::ZERO);
        info!(from = %from, tip = %tip.height(), "joining");

        if !ctx.is_member(point.height)? {
            info!(height = %point.height, "local node is not in suffrage, waiting for voteproofs");
            return Ok(Transition::Stay);
        }

        let accept = ctx.args.db.voteproofs(tip.height())?.map(|(_, accept)| accept);
        if accept.is_none() {
            warn!(tip = %tip.height(), "no voteproofs stored for tip");
        }
        self.expected = Some(point);
        hc.request_init_ballot(InitRequest {
            point,
            previous_block: tip.manifest.hash,
            voteproof: accept,
            expels: Vec::new(),
        });
        Ok(Transition::Stay)
    }

    async fn new_voteproof(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition> {
        let tip = hc.ctx.last_blockmap()?;
        let expected = tip.height().next();

        if vp.height() < expected {
            debug!(stagepoint = %vp.point(), tip = %tip.height(), "voteproof below tip ignored");
            return Ok(Transition::Stay);
        }
        if vp.height() > expected {
            return Ok(Transition::Switch(SwitchContext::sync_to(&vp)));
        }

        match vp.stage() {
            Stage::Init => {
                if let Some(f) = vp.init_majority() {
                    if f.previous_block != tip.manifest.hash {
                        warn!(
                            expected = %tip.manifest.hash,
                            found = %f.previous_block,
                            "INIT majority builds on another block"
                        );
                        return Ok(Transition::Switch(SwitchContext::sync_to(&vp)));
                    }
                }
                Ok(Transition::Switch(SwitchContext::Consensus(vp)))
            }
            _ => {
                if vp.accept_majority().is_some() {
                    Ok(Transition::Switch(SwitchContext::Syncing(vp.height())))
                } else {
                    Ok(Transition::Switch(SwitchContext::Consensus(vp)))
                }
            }
        }
    }

    async fn on_timer(&mut self, hc: &mut HandlerContext, id: TimerId) -> Result<Transition> {
        if id == TimerId::BroadcastInitBallot {
            if let Some(ballot) = &self.ballot {
                hc.ctx.broadcaster.broadcast(ballot.clone(), false);
            }
        }
        Ok(Transition::Stay)
    }

    async fn on_event(&mut self, hc: &mut HandlerContext, event: Event) -> Result<Transition> {
        if let Event::ProposalSelected(req, result) = event {
            if self.expected != Some(req.point) {
                return Ok(Transition::Stay);
            }
            self.ballot = Some(hc.broadcast_init(&req, result)?);
        }
        Ok(Transition::Stay)
    }
}
