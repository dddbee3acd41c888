use super::{Handler, HandlerContext, StateType, SwitchContext, Transition};
use crate::block::BlockReader;
use crate::consensus::Voteproof;
use crate::error::Result;
use async_trait::async_trait;
use tracing::{error, info};

/// Checks the local tip before the node takes part in anything.
pub(crate) struct BootingHandler;

#[async_trait]
impl Handler for BootingHandler {
    fn state_type(&self) -> StateType {
        StateType::Booting
    }

    async fn enter(&mut self, hc: &mut HandlerContext, _from: StateType, _sctx: SwitchContext) -> Result<Transition> {
        let args = &hc.ctx.args;
        let Some(blockmap) = args.db.last_blockmap()? else {
            error!("no block found; generate or import genesis first");
            return Ok(Transition::Switch(SwitchContext::Broken("empty block storage".to_string())));
        };

        if let Err(e) = blockmap.is_valid(&args.network_id) {
            return Ok(Transition::Switch(SwitchContext::Broken(format!(
                "last block map {}: {e}",
                blockmap.height()
            ))));
        }
        if let Err(e) = BlockReader::open(&args.block_root, blockmap.height()) {
            return Ok(Transition::Switch(SwitchContext::Broken(format!(
                "block files of {}: {e}",
                blockmap.height()
            ))));
        }

        info!(height = %blockmap.height(), block = %blockmap.manifest.hash, "local tip checked");
        Ok(Transition::Switch(SwitchContext::Joining))
    }

    async fn new_voteproof(&mut self, _hc: &mut HandlerContext, _vp: Voteproof) -> Result<Transition> {
        Ok(Transition::Stay)
    }
}
