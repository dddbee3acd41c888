use super::{Event, Handler, HandlerContext, StateType, SwitchContext, Transition};
use crate::base::CancellationToken;
use crate::consensus::{SyncError, Voteproof};
use crate::error::{ErrorKind, IsaacError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Catches up with the network. Voteproofs seen meanwhile only raise the
/// target; the node rejoins once the tip reaches it.
#[derive(Default)]
pub(crate) struct SyncingHandler {
    cancel: CancellationToken,
}

impl SyncingHandler {
    fn start(&self, hc: &HandlerContext, delay: Duration) {
        let ctx = Arc::clone(&hc.ctx);
        let cancel = self.cancel.clone();
        hc.spawn_event(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let target = ctx.syncer.target();
            Event::SyncDone(ctx.syncer.sync(target, &cancel).await)
        });
    }
}

#[async_trait]
impl Handler for SyncingHandler {
    fn state_type(&self) -> StateType {
        StateType::Syncing
    }

    async fn enter(&mut self, hc: &mut HandlerContext, from: StateType, sctx: SwitchContext) -> Result<Transition> {
        let SwitchContext::Syncing(target) = sctx else {
            return Err(IsaacError::Other("syncing entered without target".to_string()));
        };
        hc.ctx.processors.cancel();
        hc.ctx.syncer.raise_target(target);
        info!(from = %from, target = %hc.ctx.syncer.target(), "syncing started");
        self.start(hc, Duration::ZERO);
        Ok(Transition::Stay)
    }

    async fn exit(&mut self, _hc: &mut HandlerContext) {
        self.cancel.cancel();
    }

    async fn new_voteproof(&mut self, hc: &mut HandlerContext, vp: Voteproof) -> Result<Transition> {
        if let SwitchContext::Syncing(target) = SwitchContext::sync_to(&vp) {
            hc.ctx.syncer.raise_target(target);
        }
        Ok(Transition::Stay)
    }

    async fn on_event(&mut self, hc: &mut HandlerContext, event: Event) -> Result<Transition> {
        let Event::SyncDone(result) = event else {
            return Ok(Transition::Stay);
        };
        match result {
            Ok(tip) if hc.ctx.syncer.target() > tip => {
                debug!(tip = %tip, target = %hc.ctx.syncer.target(), "target raised while syncing");
                self.start(hc, Duration::ZERO);
                Ok(Transition::Stay)
            }
            Ok(tip) => {
                info!(tip = %tip, "synced");
                Ok(Transition::Switch(SwitchContext::Joining))
            }
            Err(SyncError::Canceled) => Ok(Transition::Stay),
            Err(e) if e.kind() == ErrorKind::Broken => Err(e.into()),
            Err(e) => {
                let wait = hc.ctx.args.params.sync_retry_interval;
                warn!(error = %e, retry_in = ?wait, "sync failed");
                self.start(hc, wait);
                Ok(Transition::Stay)
            }
        }
    }
}
