//! Wallet payment coordination for a storefront client.
//!
//! A payment is launched by handing the user to the wallet provider, and is
//! settled later by a redirect back into the app, by another process writing
//! the shared outcome record, or by reconciliation. [`PaymentCoordinator`]
//! ties these together.

#[cfg(feature = "cache")]
pub mod cache;
pub mod config;
pub mod logging;
pub mod payments;
pub mod workers;

pub use payments::coordinator::{CoordinatorConfig, PaymentCoordinator};
pub use payments::error::{PaymentError, PaymentResult};
pub use payments::types::{
    PaymentLaunchResult, PaymentOutcome, PaymentStatus, ResolutionSource, WaitOutcome,
};
