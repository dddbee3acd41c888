use super::{Event, Handler, HandlerContext, StateType, SwitchContext, Transition};
use crate::consensus::Voteproof;
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

/// Passive while another process takes over this node's identity: no
/// ballots are sent, blocks are only followed.
pub(crate) struct HandoverHandler;

#[async_trait]
impl Handler for HandoverHandler {
    fn state_type(&self) -> StateType {
        StateType::Handover
    }

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, _sctx: SwitchContext) -> Result<Transition> {
        hc.timers.stop_all();
        hc.ctx.processors.cancel();
        info!(from = %from, "handover started");
        Ok(Transition::Stay)
    }

    async fn new_voteproof(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition> {
        let tip = hc.ctx.last_blockmap()?.height();
        if vp.height() > tip.next() || (vp.height() == tip.next() && vp.accept_majority().is_some()) {
            return Ok(Transition::Switch(SwitchContext::sync_to(&vp)));
        }
        Ok(Transition::Stay)
    }

    async fn on_event(&mut self, _hc: &mut HandlerContext, event: Event) -> Result<Transition> {
        match event {
            Event::FinishHandover => {
                info!("handover finished");
                Ok(Transition::Switch(SwitchContext::Joining))
            }
            _ => Ok(Transition::Stay),
        }
    }
}
