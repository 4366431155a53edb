//! Process-wide state: every shared handle is constructed once here at
//! startup and passed into the watchers and the API layer. Teardown walks
//! the same handles in reverse on shutdown.

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use flowswap_core::chain::btc::BitcoinCoreClient;
use flowswap_core::chain::evm::EvmRpcClient;
use flowswap_core::chain::m1::M1Client;
use flowswap_core::watcher::evm::{EvmWatcher, EvmWatcherConfig};
use flowswap_core::watcher::utxo::{UtxoWatcher, UtxoWatcherConfig};
use flowswap_core::watcher::WatcherContext;
use flowswap_core::{
    BalanceSources, ChainHealth, ChainId, ChainSet, Inventory, KeyStore, LpConfig, PeerNotifier,
    SwapEngine, SwapStore, WatchRegistry,
};

pub struct AppContext {
    pub config: Arc<LpConfig>,
    pub store: Arc<SwapStore>,
    pub engine: Arc<SwapEngine>,
    pub health: Arc<ChainHealth>,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Construct everything in dependency order: config and keys first,
    /// then chain clients, store, inventory, engine, finally the watcher
    /// and housekeeping tasks.
    pub async fn start(config: LpConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let keys = Arc::new(
            KeyStore::load(&config.identity.key_dir).context("loading key material")?,
        );

        let network = config
            .rpc
            .btc_network
            .parse()
            .context("parsing btc network")?;
        let btc = Arc::new(
            BitcoinCoreClient::new(
                &config.rpc.btc_rpc_url,
                config.rpc.btc_rpc_user.clone(),
                config.rpc.btc_rpc_pass.clone(),
                network,
            )
            .context("connecting bitcoin rpc")?,
        );
        let m1 = Arc::new(
            M1Client::new(&config.rpc.m1_rpc_url, config.watcher.rpc_timeout_secs)
                .context("connecting m1 rpc")?,
        );
        let evm = Arc::new(
            EvmRpcClient::new(
                &config.rpc.evm_rpc_url,
                &config.rpc.evm_lp_address,
                config.watcher.rpc_timeout_secs,
            )
            .context("connecting evm rpc")?,
        );
        let chains = ChainSet {
            btc: btc.clone(),
            m1: m1.clone(),
            evm: evm.clone(),
        };

        let store = Arc::new(
            SwapStore::load(&config.store.db_path, &config.identity.lp_id)
                .context("loading swap store")?,
        );
        let inventory = Arc::new(Inventory::new(
            BalanceSources {
                btc: btc.clone(),
                m1: m1.clone(),
                evm: evm.clone(),
                usdc_token: config.rpc.usdc_token.clone(),
            },
            config.inventory.refresh_secs,
        ));
        let registry = Arc::new(WatchRegistry::default());
        let health = Arc::new(ChainHealth::default());
        let notifier = Arc::new(PeerNotifier::new(config.notify.clone()));

        let engine = Arc::new(SwapEngine::new(
            config.clone(),
            store.clone(),
            inventory.clone(),
            chains,
            keys,
            registry.clone(),
            notifier,
        )?);

        // Resume scan before the watchers start: non-terminal swaps get
        // their subscriptions back so the first tick re-derives leg state.
        let resumed = engine.resume().await?;
        if resumed > 0 {
            info!(count = resumed, "resumed non-terminal swaps");
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let watcher_ctx = WatcherContext {
            registry: registry.clone(),
            health: health.clone(),
            events: event_tx.clone(),
            stop: stop_rx.clone(),
        };
        tasks.push(tokio::spawn(
            UtxoWatcher::new(
                btc,
                watcher_ctx.clone(),
                UtxoWatcherConfig {
                    chain: ChainId::Btc,
                    poll_secs: config.watcher.btc_poll_secs,
                    degraded_poll_secs: config.watcher.degraded_poll_secs,
                    reorg_depth: config.watcher.btc_reorg_depth,
                },
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            UtxoWatcher::new(
                m1,
                watcher_ctx.clone(),
                UtxoWatcherConfig {
                    chain: ChainId::M1,
                    poll_secs: config.watcher.m1_poll_secs,
                    degraded_poll_secs: config.watcher.degraded_poll_secs,
                    reorg_depth: config.watcher.m1_reorg_depth,
                },
            )
            .run(),
        ));
        tasks.push(tokio::spawn(
            EvmWatcher::new(
                evm,
                watcher_ctx,
                EvmWatcherConfig {
                    contract: config.rpc.evm_htlc_contract.clone(),
                    poll_secs: config.watcher.evm_poll_secs,
                    degraded_poll_secs: config.watcher.degraded_poll_secs,
                    reorg_depth: config.watcher.evm_reorg_depth,
                    min_depth: config.confirmations.evm_min_depth,
                },
            )
            .run(),
        ));

        tasks.push(tokio::spawn(
            engine.clone().run(event_rx, stop_rx.clone()),
        ));

        // Housekeeping: engine ticks, balance refresh, terminal archival.
        {
            let engine = engine.clone();
            let mut stop = stop_rx.clone();
            let tick = std::time::Duration::from_secs(config.watcher.btc_poll_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(tick) => engine.tick_all().await,
                        _ = stop.changed() => break,
                    }
                }
            }));
        }
        {
            let inventory = inventory.clone();
            let mut stop = stop_rx.clone();
            let period = std::time::Duration::from_secs(config.inventory.refresh_secs);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(period) => {
                            inventory.refresh(flowswap_core::engine::unix_now()).await;
                        }
                        _ = stop.changed() => break,
                    }
                }
            }));
        }
        {
            let engine = engine.clone();
            let mut stop = stop_rx;
            let grace = config.store.archive_grace_hours * 3600;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(3600)) => {
                            if let Err(e) = engine.archive_terminal(grace).await {
                                tracing::warn!(error = %e, "archival pass failed");
                            }
                        }
                        _ = stop.changed() => break,
                    }
                }
            }));
        }

        Ok(AppContext {
            config,
            store,
            engine,
            health,
            stop_tx,
            tasks,
        })
    }

    /// Signal every task to stop and wait for the drain window.
    pub async fn shutdown(mut self) {
        info!("shutting down");
        let _ = self.stop_tx.send(true);
        let drain =
            std::time::Duration::from_secs(self.config.engine.shutdown_drain_secs);
        let tasks = std::mem::take(&mut self.tasks);
        if tokio::time::timeout(drain, futures_join_all(tasks)).await.is_err() {
            tracing::warn!("tasks still running after drain window");
        }
        info!("shutdown complete");
    }
}

async fn futures_join_all(tasks: Vec<JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}
