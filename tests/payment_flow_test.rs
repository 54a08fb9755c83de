//! End-to-end payment flows through the coordinator
//!
//! Tests cover:
//! - Launch, redirect and a concurrent wait settling to success
//! - Cancellation codes and the terminal-wins merge
//! - Validation before any side effect
//! - Timeouts leaving the durable record pending
//! - Two coordinators sharing one durable store
//! - Redelivered and unrelated redirects

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storefront_payments::payments::{
    CoordinatorConfig, CreatePaymentResponse, InMemoryOutcomeStore, OutcomeStore,
    PaymentCoordinator, PaymentError, PaymentLaunchResult, PaymentRequest, PaymentResult,
    PaymentStatus, ProviderStatus, ResolutionSource, UriOpener, WalletProvider,
};
use tokio::sync::{mpsc, watch};

const REDIRECT: &str = "storefront://payment-result";

struct FakeProvider {
    create_calls: AtomicUsize,
}

impl FakeProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            create_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WalletProvider for FakeProvider {
    async fn create_payment(&self, request: &PaymentRequest) -> PaymentResult<CreatePaymentResponse> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(CreatePaymentResponse {
            result_code: 0,
            message: "Successful.".to_string(),
            pay_url: Some(format!("https://pay.example/{}", request.order_id)),
            deeplink: None,
        })
    }

    async fn query_status(&self, order_id: &str) -> PaymentResult<ProviderStatus> {
        Ok(ProviderStatus {
            order_id: order_id.to_string(),
            result_code: 1000,
            message: "in progress".to_string(),
            transaction_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "fake"
    }

    fn partner_code(&self) -> &str {
        "TEST"
    }
}

#[derive(Default)]
struct RecordingOpener {
    opened: Mutex<Vec<String>>,
}

impl UriOpener for RecordingOpener {
    fn can_open(&self, uri: &str) -> bool {
        uri.starts_with("https://")
    }

    fn open(&self, uri: &str) -> PaymentResult<()> {
        self.opened.lock().unwrap().push(uri.to_string());
        Ok(())
    }
}

fn coordinator(
    store: &InMemoryOutcomeStore,
    provider: Arc<FakeProvider>,
) -> Arc<PaymentCoordinator> {
    let config = CoordinatorConfig {
        redirect_target: REDIRECT.to_string(),
        ..Default::default()
    };
    Arc::new(PaymentCoordinator::new(
        config,
        provider,
        Arc::new(RecordingOpener::default()),
        Arc::new(store.clone()),
    ))
}

fn redirect(order_id: &str, result_code: i64, trans_id: &str) -> String {
    format!(
        "{}?partnerCode=TEST&orderId={}&requestId={}&amount=50000&resultCode={}&transId={}&message=done",
        REDIRECT, order_id, order_id, result_code, trans_id
    )
}

async fn launch(coordinator: &PaymentCoordinator) -> String {
    match coordinator.initiate(50_000, "order #1").await.unwrap() {
        PaymentLaunchResult::Pending { order_id, .. } => order_id,
        other => panic!("launch failed: {:?}", other),
    }
}

#[tokio::test]
async fn test_callback_success_resolves_concurrent_wait() {
    let store = InMemoryOutcomeStore::new();
    let coordinator = coordinator(&store, FakeProvider::new());
    let order_id = launch(&coordinator).await;

    let wait = tokio::spawn({
        let coordinator = coordinator.clone();
        let order_id = order_id.clone();
        async move {
            coordinator
                .await_result(&order_id, Duration::from_millis(300_000))
                .await
        }
    });
    while coordinator.registry().subscriber_count(&order_id) == 0 {
        tokio::task::yield_now().await;
    }

    let settled = coordinator
        .handle_redirect(&redirect(&order_id, 0, "T-1"))
        .await
        .expect("payment redirect");
    assert_eq!(settled.status, PaymentStatus::Success);

    let result = wait.await.unwrap();
    assert_eq!(result.outcome.status, PaymentStatus::Success);
    assert_eq!(result.outcome.transaction_id.as_deref(), Some("T-1"));

    let record = store.get(&order_id).await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Success);
    assert_eq!(record.transaction_id.as_deref(), Some("T-1"));
    assert_eq!(record.result_code, Some(0));
    assert_eq!(record.amount, Some(50_000));

    assert_eq!(coordinator.registry().total_subscribers(), 0);
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn test_cancel_code_settles_and_cannot_flip_to_success() {
    let store = InMemoryOutcomeStore::new();
    let coordinator = coordinator(&store, FakeProvider::new());
    let order_id = launch(&coordinator).await;

    let cancelled = coordinator
        .handle_redirect(&redirect(&order_id, 1006, "0"))
        .await
        .unwrap();
    assert_eq!(cancelled.status, PaymentStatus::Cancelled);

    let replay = coordinator
        .handle_redirect(&redirect(&order_id, 0, "T-2"))
        .await
        .unwrap();
    assert_eq!(replay.status, PaymentStatus::Cancelled);

    let record = store.get(&order_id).await.unwrap().unwrap();
    assert_eq!(record.status, PaymentStatus::Cancelled);
    assert_eq!(record.transaction_id, None);
}

#[tokio::test]
async fn test_zero_amount_makes_no_call_and_no_record() {
    let store = InMemoryOutcomeStore::new();
    let provider = FakeProvider::new();
    let coordinator = coordinator(&store, provider.clone());

    let err = coordinator.initiate(0, "free").await.unwrap_err();
    assert!(matches!(err, PaymentError::ValidationError { .. }));
    assert_eq!(provider.create_calls.load(Ordering::SeqCst), 0);

    let horizon = Utc::now() + chrono::Duration::days(1);
    assert!(store.list_pending(horizon, 100).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_and_record_stays_pending() {
    let store = InMemoryOutcomeStore::new();
    let coordinator = coordinator(&store, FakeProvider::new());
    let order_id = launch(&coordinator).await;

    let result = coordinator
        .await_result(&order_id, Duration::from_millis(1000))
        .await;
    assert_eq!(result.source, ResolutionSource::TimedOut);
    assert_eq!(result.outcome.status, PaymentStatus::Cancelled);
    assert_eq!(result.outcome.message.as_deref(), Some("timed out"));

    assert_eq!(
        store.get(&order_id).await.unwrap().map(|r| r.status),
        Some(PaymentStatus::Pending)
    );
    assert_eq!(coordinator.registry().total_subscribers(), 0);
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn test_two_processes_agree_on_final_status() {
    let store = InMemoryOutcomeStore::new();
    let device = coordinator(&store, FakeProvider::new());
    let other = coordinator(&store, FakeProvider::new());
    let order_id = launch(&device).await;

    let waits: Vec<_> = [device.clone(), other.clone()]
        .into_iter()
        .map(|coordinator| {
            let order_id = order_id.clone();
            tokio::spawn(async move {
                coordinator
                    .await_result(&order_id, Duration::from_secs(300))
                    .await
            })
        })
        .collect();
    while store.watcher_count() < 2 {
        tokio::task::yield_now().await;
    }

    // Only the launching device receives the redirect.
    device
        .handle_redirect(&redirect(&order_id, 0, "T-3"))
        .await
        .unwrap();

    let mut results = Vec::new();
    for wait in waits {
        results.push(wait.await.unwrap());
    }
    for result in &results {
        assert_eq!(result.outcome.status, PaymentStatus::Success);
        assert_eq!(result.outcome.transaction_id.as_deref(), Some("T-3"));
    }
    assert_eq!(results[1].source, ResolutionSource::DurableStore);
    assert_eq!(other.registry().total_subscribers(), 0);
    assert_eq!(store.watcher_count(), 0);

    // The other process now answers from its own cache too.
    assert_eq!(
        other.status(&order_id).await.map(|o| o.status),
        Some(PaymentStatus::Success)
    );
}

#[tokio::test]
async fn test_wait_after_settlement_returns_immediately() {
    let store = InMemoryOutcomeStore::new();
    let coordinator = coordinator(&store, FakeProvider::new());
    let order_id = launch(&coordinator).await;
    coordinator
        .handle_redirect(&redirect(&order_id, 31337, "0"))
        .await
        .unwrap();

    let result = coordinator
        .await_result(&order_id, Duration::from_secs(300))
        .await;
    assert_eq!(result.source, ResolutionSource::AlreadySettled);
    assert_eq!(result.outcome.status, PaymentStatus::Failed);
    assert!(result.outcome.unrecognized_code);
    assert_eq!(coordinator.registry().total_subscribers(), 0);
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn test_unrelated_and_malformed_redirects_are_ignored() {
    let store = InMemoryOutcomeStore::new();
    let coordinator = coordinator(&store, FakeProvider::new());

    assert!(coordinator
        .handle_redirect("storefront://cart?orderId=X&resultCode=0")
        .await
        .is_none());
    assert!(coordinator
        .handle_redirect(&format!("{}?resultCode=0", REDIRECT))
        .await
        .is_none());
    assert!(store.get("X").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ingress_loop_routes_uris_until_shutdown() {
    let store = InMemoryOutcomeStore::new();
    let coordinator = coordinator(&store, FakeProvider::new());
    let order_id = launch(&coordinator).await;

    let (uri_tx, uri_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ingress = tokio::spawn(coordinator.clone().run_ingress(uri_rx, shutdown_rx));

    uri_tx.send("https://unrelated.example/".to_string()).await.unwrap();
    uri_tx.send(redirect(&order_id, 1003, "0")).await.unwrap();

    let result = coordinator
        .await_result(&order_id, Duration::from_secs(300))
        .await;
    assert_eq!(result.outcome.status, PaymentStatus::Cancelled);

    shutdown_tx.send(true).unwrap();
    ingress.await.unwrap();
}
