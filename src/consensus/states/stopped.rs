use super::{Handler, HandlerContext, StateType, SwitchContext, Transition};
use crate::consensus::Voteproof;
use crate::error::Result;
use async_trait::async_trait;
use tracing::info;

pub(crate) struct StoppedHandler;

#[async_trait]
impl Handler for StoppedHandler {
    fn state_type(&self) -> StateType {
        StateType::Stopped
    }

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, _sctx: SwitchContext) -> Result<Transition> {
        hc.timers.stop_all();
        hc.ctx.processors.cancel();
        info!(from = %from, "node stopped");
        Ok(Transition::Stay)
    }

    async fn new_voteproof(&mut self, _hc: &mut HandlerContext, _vp: Voteproof) -> Result<Transition> {
        Ok(Transition::Stay)
    }
}
