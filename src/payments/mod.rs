pub mod callback;
pub mod coordinator;
pub mod error;
pub mod launcher;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod signature;
pub mod status;
pub mod store;
#[cfg(feature = "cache")]
pub mod store_redis;
pub mod types;
pub mod utils;
pub mod waiter;

pub use callback::{CallbackIngress, IngressDecision};
pub use coordinator::{CoordinatorConfig, PaymentCoordinator};
pub use error::{PaymentError, PaymentResult};
pub use launcher::{ConsoleUriOpener, RedirectLauncher, UriOpener};
pub use provider::{CreatePaymentResponse, ProviderStatus, WalletProvider};
pub use providers::{MomoConfig, MomoProvider};
pub use registry::{Subscription, SubscriptionRegistry};
pub use signature::SignatureEngine;
pub use status::{StatusCache, StatusTracker};
pub use store::{InMemoryOutcomeStore, OutcomeStore, StatusStoreBridge};
#[cfg(feature = "cache")]
pub use store_redis::RedisOutcomeStore;
pub use types::*;
pub use waiter::ResultWaiter;
