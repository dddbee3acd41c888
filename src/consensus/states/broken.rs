use super::{Handler, HandlerContext, StateType, SwitchContext, Transition};
use crate::consensus::Voteproof;
use crate::error::Result;
use async_trait::async_trait;
use tracing::error;

/// Terminal until an operator intervenes; consensus work is dropped.
pub(crate) struct BrokenHandler;

#[async_trait]
impl Handler for BrokenHandler {
    fn state_type(&self) -> StateType {
        StateType::Broken
    }

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, sctx: SwitchContext) -> Result<Transition> {
        hc.timers.stop_all();
        hc.ctx.processors.cancel();
        let reason = match sctx {
            SwitchContext::Broken(reason) => reason,
            _ => "unknown".to_string(),
        };
        error!(from = %from, %reason, "node is broken");
        Ok(Transition::Stay)
    }

    async fn new_voteproof(&mut self, _hc: &mut HandlerContext, _vp: Voteproof) -> Result<Transition> {
        Ok(Transition::Stay)
    }
}
