//! Common types module for the payment watcher system.
//!
//! This module defines the core data types shared by every watcher component:
//! merchant accounts and the tokens they accept, invoices consumed from the
//! invoice source, transfers observed on chain and the matches produced for
//! settlement. Keeping them in one crate lets the chain client, scanner and
//! engine agree on a single vocabulary.

/// Merchant account and token identity types.
pub mod account;
/// Chain-level data returned by chain client implementations.
pub mod chain;
/// Event types for inter-component communication.
pub mod events;
/// Invoice and payment method types consumed from the invoice source.
pub mod invoice;
/// Registry trait for self-registering implementations.
pub mod registry;
/// Storage types for managing persistent data.
pub mod storage;
/// Observed transfers and the matches built from them.
pub mod transfer;
/// Utility functions for common type conversions.
pub mod utils;
/// Configuration validation types for ensuring type-safe configurations.
pub mod validation;

// Re-export all types for convenient access
pub use account::*;
pub use chain::*;
pub use events::*;
pub use invoice::*;
pub use registry::ImplementationRegistry;
pub use storage::*;
pub use transfer::*;
pub use utils::{
	current_timestamp, format_token_amount, payment_uri, raw_to_decimal, truncate_id,
	with_0x_prefix, without_0x_prefix,
};
pub use validation::*;
