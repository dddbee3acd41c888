use isaac_node::base::{CancellationToken, LocalNode};
use isaac_node::block::GenesisGenerator;
use isaac_node::config::NodeConfig;
use isaac_node::consensus::{ConsensusContext, NodeArgs, StateDriver, SyncSourceChecker};
use isaac_node::error::IsaacError;
use isaac_node::logger::{self, LogFormat};
use isaac_node::network::{start_server, HttpClient, NodeService};
use isaac_node::storage::{MemPool, PermanentDatabase, SqliteDatabase};
use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

/// Writes block 0 when the database is empty and the local node is one of
/// the configured genesis nodes.
fn genesis_if_empty(config: &NodeConfig, local: &LocalNode, db: &Arc<dyn PermanentDatabase>) -> Result<(), IsaacError> {
    if let Some(tip) = db.last_blockmap()? {
        info!(height = %tip.height(), block = %tip.manifest.hash, "database opened");
        return Ok(());
    }
    if !config.genesis.iter().any(|p| &p.address == local.address()) {
        warn!("empty database and local node is not a genesis node; import blocks before starting");
        return Ok(());
    }

    let nodes = config.genesis.iter().map(|p| p.node()).collect();
    let genesis = GenesisGenerator::new(
        local.clone(),
        config.network_id.clone(),
        nodes,
        config.storage.blocks.clone(),
        Arc::clone(db),
    )
    .generate()?;
    info!(block = %genesis.manifest.hash, "genesis block created");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    logger::init_logger(LogFormat::from_env());

    let path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.json"));
    let config = NodeConfig::load(&path)?;
    let params = config.params.clone();
    let local = LocalNode::new(config.address.clone(), config.privatekey()?);
    info!(
        node = %local.address(),
        network = %config.network_id,
        config = %path.display(),
        "starting node"
    );

    std::fs::create_dir_all(&config.storage.blocks)?;
    let db: Arc<dyn PermanentDatabase> = Arc::new(SqliteDatabase::open(&config.storage.database)?);
    genesis_if_empty(&config, &local, &db)?;

    let pool = Arc::new(MemPool::new(
        params.valid_proposal_operation_expire,
        params.valid_proposal_suffrage_operations_expire,
    ));
    let client = Arc::new(HttpClient::new(params.timeout_request, params.max_message_size)?);

    let args = NodeArgs {
        local: local.clone(),
        network_id: config.network_id.clone(),
        params: params.clone(),
        db: Arc::clone(&db),
        pool: pool.clone(),
        block_root: config.storage.blocks.clone(),
        client: client.clone(),
        peers: config
            .peers
            .iter()
            .filter(|p| &p.address != local.address())
            .map(|p| p.conn_info())
            .collect(),
    };
    let sync_sources = config.sync_sources.iter().map(|p| p.conn_info()).collect();
    let (ctx, voteproofs) = ConsensusContext::build(args, sync_sources);
    let (driver, states) = StateDriver::new(Arc::clone(&ctx), voteproofs);

    let service = Arc::new(NodeService::new(
        local.clone(),
        config.network_id.clone(),
        Arc::clone(&db),
        pool,
        config.storage.blocks.clone(),
        Arc::clone(&ctx.queue),
        Arc::clone(&ctx.maker),
        Arc::clone(&ctx.sync_sources),
        states.clone(),
    ));
    let bind = config.bind.clone();
    let max_message_size = params.max_message_size as usize;
    info!(bind = %bind, url = %config.public_url(), "starting HTTP server");
    thread::spawn(move || {
        actix_rt::System::new().block_on(async move {
            if let Err(e) = start_server(bind, service, max_message_size).await {
                error!(error = %e, "HTTP server stopped");
            }
        });
    });

    let cancel = CancellationToken::new();
    tokio::spawn(Arc::clone(&ctx.queue).run(Arc::clone(&ctx.ballotbox), cancel.clone()));
    let checker = Arc::new(SyncSourceChecker::new(
        local.address().clone(),
        config.network_id.clone(),
        client,
        Arc::clone(&ctx.sync_sources),
        &params,
    ));
    tokio::spawn(checker.run(cancel.clone()));

    let mut driver = tokio::spawn(driver.run());
    let last = tokio::select! {
        finished = &mut driver => finished?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping");
            states.stop().await;
            (&mut driver).await?
        }
    };
    cancel.cancel();

    info!(state = %last, "node stopped");
    Ok(())
}
