//! Event types for inter-component communication.
//!
//! The engine publishes these on its event bus so that other parts of the
//! process (logging sinks, notification hooks, tests) can follow scan cycles
//! and payment progress without coupling to the engine internals.

use crate::{Match, SettlementOutcome, TransferRef};
use serde::{Deserialize, Serialize};

/// Events emitted by the watcher engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WatcherEvent {
	Scan(ScanEvent),
	Payment(PaymentEvent),
}

/// Per-account scan cycle outcomes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScanEvent {
	/// A cycle finished and covered `[from_block, to_block]`.
	Completed {
		account_id: String,
		from_block: u64,
		to_block: u64,
		transfers: usize,
		matches: usize,
	},
	/// The account had no open invoices; no chain calls were made.
	Skipped { account_id: String },
	/// The cycle failed and will be retried on the next tick.
	Failed { account_id: String, error: String },
}

/// Payment progress for individual transfers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PaymentEvent {
	/// A qualifying transfer has not reached the confirmation depth yet.
	Pending {
		account_id: String,
		invoice_id: String,
		transfer: TransferRef,
		confirmations: u64,
		required: u64,
	},
	/// A transfer satisfied an invoice payment method.
	Matched { account_id: String, matched: Match },
	/// The settlement sink accepted (or had already accepted) the match.
	Settled {
		account_id: String,
		invoice_id: String,
		transfer: TransferRef,
		outcome: SettlementOutcome,
	},
	/// The settlement sink declined the match.
	Rejected {
		account_id: String,
		invoice_id: String,
		transfer: TransferRef,
		reason: String,
	},
}
