use std::sync::Arc;
use storefront_payments::config::AppConfig;
use storefront_payments::logging::init_tracing;
use storefront_payments::payments::{
    ConsoleUriOpener, InMemoryOutcomeStore, MomoProvider, OutcomeStore, PaymentCoordinator,
    PaymentLaunchResult, WalletProvider,
};
use storefront_payments::workers::reconciliation::ReconciliationWorker;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[cfg(feature = "cache")]
use storefront_payments::cache::{init_cache_pool, shutdown_cache_pool, RedisPool};
#[cfg(feature = "cache")]
use storefront_payments::payments::RedisOutcomeStore;

#[cfg(not(feature = "cache"))]
type RedisPool = ();

#[cfg(not(feature = "cache"))]
async fn shutdown_cache_pool(_pool: RedisPool) {}

const INGRESS_BUFFER: usize = 64;

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[cfg(feature = "cache")]
async fn durable_store(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn OutcomeStore>, Option<RedisPool>)> {
    info!("Initializing Redis outcome store...");
    let pool = init_cache_pool(&config.cache).await.map_err(|e| {
        error!("Failed to initialize cache pool: {}", e);
        e
    })?;
    let store: Arc<dyn OutcomeStore> =
        Arc::new(RedisOutcomeStore::new(pool.clone(), &config.cache.redis_url)?);
    info!(redis_url = %config.cache.redis_url, "Redis outcome store ready");
    Ok((store, Some(pool)))
}

#[cfg(not(feature = "cache"))]
async fn durable_store(
    _config: &AppConfig,
) -> anyhow::Result<(Arc<dyn OutcomeStore>, Option<RedisPool>)> {
    warn!("Built without the cache feature; using in-process outcome store");
    let store: Arc<dyn OutcomeStore> = Arc::new(InMemoryOutcomeStore::new());
    Ok((store, None))
}

/// One line of host input.
#[derive(Debug, PartialEq, Eq)]
enum HostCommand {
    /// `pay <amount> <order info>`
    Pay { amount: u64, order_info: String },
    /// `status <orderId>`
    Status { order_id: String },
    /// Anything else is a URI delivered back into the app.
    Redirect(String),
}

impl HostCommand {
    fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
        match head {
            "pay" => {
                let (amount, order_info) = rest.trim().split_once(' ').unwrap_or((rest, ""));
                let amount = amount
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("invalid amount: {}", amount.trim()))?;
                Ok(HostCommand::Pay {
                    amount,
                    order_info: order_info.trim().to_string(),
                })
            }
            "status" if !rest.trim().is_empty() => Ok(HostCommand::Status {
                order_id: rest.trim().to_string(),
            }),
            _ => Ok(HostCommand::Redirect(line.to_string())),
        }
    }
}

async fn start_payment(coordinator: Arc<PaymentCoordinator>, amount: u64, order_info: String) {
    let launch = match coordinator.initiate(amount, &order_info).await {
        Ok(launch) => launch,
        Err(e) => {
            warn!(error = %e, "payment not started");
            return;
        }
    };

    let order_id = match launch {
        PaymentLaunchResult::Pending { order_id, .. } => order_id,
        PaymentLaunchResult::Failed {
            order_id, message, ..
        } => {
            warn!(order_id = ?order_id, message = %message, "payment launch failed");
            return;
        }
    };

    let waited = coordinator.await_default(&order_id).await;
    let source = waited.source;
    match waited.into_result(coordinator.config().wait_timeout) {
        Ok(outcome) => info!(
            order_id = %order_id,
            status = %outcome.status,
            source = ?source,
            transaction_id = ?outcome.transaction_id,
            message = ?outcome.message,
            "payment finished"
        ),
        Err(e) => warn!(
            order_id = %order_id,
            error = %e,
            user_message = %e.user_message(),
            "payment still pending, reconciliation will settle it"
        ),
    }
}

/// Reads host input from stdin, one command or redirect URI per line.
async fn read_host_input(coordinator: Arc<PaymentCoordinator>, uris: mpsc::Sender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "failed to read host input");
                break;
            }
        };

        match HostCommand::parse(&line) {
            Ok(HostCommand::Pay { amount, order_info }) => {
                tokio::spawn(start_payment(coordinator.clone(), amount, order_info));
            }
            Ok(HostCommand::Status { order_id }) => match coordinator.status(&order_id).await {
                Some(outcome) => info!(
                    order_id = %order_id,
                    status = %outcome.status,
                    result_code = ?outcome.result_code,
                    "payment status"
                ),
                None => info!(order_id = %order_id, "unknown order"),
            },
            Ok(HostCommand::Redirect(uri)) => {
                if uris.send(uri).await.is_err() {
                    break;
                }
            }
            Err(reason) => warn!(reason = %reason, "ignoring host input"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        partner_code = %config.momo.partner_code,
        endpoint = %config.momo.endpoint,
        redirect_target = %config.coordinator.redirect_target,
        "Starting storefront payments service"
    );

    let (store, redis_pool) = if config.skip_externals {
        info!("Using in-process outcome store (SKIP_EXTERNALS=true)");
        let store: Arc<dyn OutcomeStore> = Arc::new(InMemoryOutcomeStore::new());
        (store, None)
    } else {
        durable_store(&config).await?
    };

    let provider: Arc<dyn WalletProvider> = Arc::new(MomoProvider::new(config.momo.clone())?);
    let coordinator = Arc::new(PaymentCoordinator::new(
        config.coordinator.clone(),
        provider.clone(),
        Arc::new(ConsoleUriOpener::default()),
        store,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = ReconciliationWorker::new(
        provider,
        coordinator.tracker().clone(),
        config.reconciliation.clone(),
    );
    let worker_handle = tokio::spawn(worker.run(shutdown_rx.clone()));

    let (uri_tx, uri_rx) = mpsc::channel(INGRESS_BUFFER);
    tokio::spawn(read_host_input(coordinator.clone(), uri_tx));
    let ingress_handle = tokio::spawn(coordinator.clone().run_ingress(uri_rx, shutdown_rx));

    shutdown_signal_with_notify(shutdown_tx).await;

    if let Err(e) = ingress_handle.await {
        warn!(error = %e, "redirect ingress task ended abnormally");
    }
    if let Err(e) = worker_handle.await {
        warn!(error = %e, "reconciliation worker ended abnormally");
    }

    if let Some(pool) = redis_pool {
        shutdown_cache_pool(pool).await;
    }

    info!("Storefront payments service stopped");
    Ok(())
}
