//! Collaborators the engine reads from and reports to.
//!
//! Accounts, invoices and settlement live outside the watcher. The engine only
//! sees them through the traits below; [`storage`] provides implementations
//! backed by the watcher's own storage service.

use async_trait::async_trait;
use thiserror::Error;
use watcher_types::{Account, Invoice, Match, SettlementOutcome, TransferRef};

pub mod storage;

pub use storage::{ConfigAccountSource, SettlementRecord, StorageInvoiceSource, StorageSettlementSink};

/// Errors raised by an external source or sink.
#[derive(Debug, Error)]
pub enum SourceError {
	#[error("Backend error: {0}")]
	Backend(String),
	#[error("Unavailable: {0}")]
	Unavailable(String),
}

/// Merchant account configuration and scan cursors.
#[async_trait]
pub trait AccountSource: Send + Sync {
	/// All accounts currently under watch.
	async fn accounts(&self) -> Result<Vec<Account>, SourceError>;

	/// One account by id, or `None` if it is no longer configured.
	async fn account(&self, account_id: &str) -> Result<Option<Account>, SourceError> {
		Ok(self
			.accounts()
			.await?
			.into_iter()
			.find(|account| account.id == account_id))
	}

	/// Records that blocks up to `height` were scanned for `account_id`.
	///
	/// Heights lower than the stored one are ignored.
	async fn record_scanned_height(&self, account_id: &str, height: u64)
		-> Result<(), SourceError>;
}

/// Read-only view of invoices awaiting payment.
#[async_trait]
pub trait InvoiceSource: Send + Sync {
	/// Invoices of `account_id` with at least one outstanding payment method.
	async fn open_invoices(&self, account_id: &str) -> Result<Vec<Invoice>, SourceError>;
}

/// Receiver of match decisions.
///
/// Implementations must be idempotent by transfer reference: applying the
/// same transfer twice yields [`SettlementOutcome::AlreadySettled`].
#[async_trait]
pub trait SettlementSink: Send + Sync {
	async fn apply(&self, matched: &Match) -> Result<SettlementOutcome, SourceError>;

	/// Whether `transfer` was already credited to some invoice.
	///
	/// Settled transfers stay in the scan window for a while and must not be
	/// offered to another invoice.
	async fn is_settled(&self, transfer: &TransferRef) -> Result<bool, SourceError>;
}
