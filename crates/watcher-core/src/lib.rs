//! Core engine for the payment watcher.
//!
//! Ties the transfer scanner, the confirmation gate and the invoice matcher
//! together into per-account scan cycles, and drives those cycles on each
//! account's schedule until shutdown.

pub mod builder;
pub mod confirmation;
pub mod engine;
pub mod matcher;
pub mod sources;

pub use builder::{BuilderError, WatcherBuilder, WatcherFactories};
pub use confirmation::{confirmations, ConfirmationCheckFailure};
pub use engine::{
	event_bus::EventBus, schedule::run_every, scan_window, CycleOutcome, EngineError,
	WatcherEngine,
};
pub use matcher::{match_transfers, MatchReport, PendingPayment};
pub use sources::{
	AccountSource, ConfigAccountSource, InvoiceSource, SettlementSink, SourceError,
	StorageInvoiceSource, StorageSettlementSink,
};
