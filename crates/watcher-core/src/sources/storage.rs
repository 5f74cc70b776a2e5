//! Storage-backed sources and settlement sink.
//!
//! Open invoices are kept per account under [`StorageKey::Invoices`], scan
//! cursors under [`StorageKey::ScanCursors`] and settlement records, keyed by
//! transfer reference, under [`StorageKey::Settlements`].

use super::{AccountSource, InvoiceSource, SettlementSink, SourceError};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use watcher_storage::{StorageError, StorageService};
use watcher_types::{
	current_timestamp, Account, Invoice, Match, SettlementOutcome, StorageKey, TransferRef,
};

impl From<StorageError> for SourceError {
	fn from(err: StorageError) -> Self {
		SourceError::Backend(err.to_string())
	}
}

/// Accounts come from configuration; cursors are persisted in storage.
pub struct ConfigAccountSource {
	accounts: Vec<Account>,
	storage: Arc<StorageService>,
}

impl ConfigAccountSource {
	pub fn new(accounts: Vec<Account>, storage: Arc<StorageService>) -> Self {
		Self { accounts, storage }
	}
}

#[async_trait]
impl AccountSource for ConfigAccountSource {
	async fn accounts(&self) -> Result<Vec<Account>, SourceError> {
		let mut accounts = Vec::with_capacity(self.accounts.len());
		for account in &self.accounts {
			let cursor = self
				.storage
				.retrieve_optional::<u64>(StorageKey::ScanCursors, &account.id)
				.await?;
			accounts.push(Account {
				last_scanned_block: cursor,
				..account.clone()
			});
		}
		Ok(accounts)
	}

	async fn record_scanned_height(
		&self,
		account_id: &str,
		height: u64,
	) -> Result<(), SourceError> {
		let current = self
			.storage
			.retrieve_optional::<u64>(StorageKey::ScanCursors, account_id)
			.await?;
		if current.is_some_and(|stored| stored >= height) {
			return Ok(());
		}
		self.storage
			.store(StorageKey::ScanCursors, account_id, &height)
			.await?;
		Ok(())
	}
}

/// Open invoices stored per account.
pub struct StorageInvoiceSource {
	storage: Arc<StorageService>,
}

impl StorageInvoiceSource {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Inserts or replaces an invoice for `account_id`.
	pub async fn upsert(&self, account_id: &str, invoice: Invoice) -> Result<(), SourceError> {
		let mut invoices = load_invoices(&self.storage, account_id).await?;
		match invoices.iter_mut().find(|existing| existing.id == invoice.id) {
			Some(existing) => *existing = invoice,
			None => invoices.push(invoice),
		}
		self.storage
			.store(StorageKey::Invoices, account_id, &invoices)
			.await?;
		Ok(())
	}
}

#[async_trait]
impl InvoiceSource for StorageInvoiceSource {
	async fn open_invoices(&self, account_id: &str) -> Result<Vec<Invoice>, SourceError> {
		Ok(load_invoices(&self.storage, account_id)
			.await?
			.into_iter()
			.filter(Invoice::is_open)
			.collect())
	}
}

async fn load_invoices(
	storage: &StorageService,
	account_id: &str,
) -> Result<Vec<Invoice>, SourceError> {
	Ok(storage
		.retrieve_optional::<Vec<Invoice>>(StorageKey::Invoices, account_id)
		.await?
		.unwrap_or_default())
}

/// Persisted proof that a transfer was credited to an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
	pub transfer: TransferRef,
	pub account_id: String,
	pub invoice_id: String,
	pub payment_method_id: String,
	pub amount: Decimal,
	pub confirmations: u64,
	pub settled_at: u64,
}

/// Credits matches against the stored invoices.
///
/// Applying a match lowers the due amount of the matched payment method by the
/// transfer amount (never below zero) and records the transfer so that a
/// second delivery of the same match is a no-op.
pub struct StorageSettlementSink {
	storage: Arc<StorageService>,
	/// Serializes read-modify-write cycles on the invoice list.
	write_lock: Mutex<()>,
}

impl StorageSettlementSink {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self {
			storage,
			write_lock: Mutex::new(()),
		}
	}

	/// Settlement record for a transfer, if it was applied.
	pub async fn record(&self, transfer: &TransferRef) -> Result<Option<SettlementRecord>, SourceError> {
		Ok(self
			.storage
			.retrieve_optional(StorageKey::Settlements, &transfer.to_string())
			.await?)
	}
}

#[async_trait]
impl SettlementSink for StorageSettlementSink {
	async fn apply(&self, matched: &Match) -> Result<SettlementOutcome, SourceError> {
		let _guard = self.write_lock.lock().await;

		let reference = matched.transfer.reference();
		let record_key = reference.to_string();
		if self
			.storage
			.exists(StorageKey::Settlements, &record_key)
			.await?
		{
			return Ok(SettlementOutcome::AlreadySettled);
		}

		let mut invoices = load_invoices(&self.storage, &matched.account_id).await?;
		let Some(invoice) = invoices.iter_mut().find(|i| i.id == matched.invoice_id) else {
			return Ok(SettlementOutcome::Rejected {
				reason: format!("Unknown invoice {}", matched.invoice_id),
			});
		};
		let Some(method) = invoice.method_mut(&matched.payment_method_id) else {
			return Ok(SettlementOutcome::Rejected {
				reason: format!(
					"Invoice {} has no payment method {}",
					matched.invoice_id, matched.payment_method_id
				),
			});
		};
		if method.token != matched.transfer.token {
			return Ok(SettlementOutcome::Rejected {
				reason: format!(
					"Payment method {} expects {}, transfer is {}",
					method.id, method.token, matched.transfer.token
				),
			});
		}
		if !method.is_outstanding() {
			return Ok(SettlementOutcome::Rejected {
				reason: format!("Payment method {} is already paid", method.id),
			});
		}

		method.due = (method.due - matched.amount).max(Decimal::ZERO);

		let record = SettlementRecord {
			transfer: reference,
			account_id: matched.account_id.clone(),
			invoice_id: matched.invoice_id.clone(),
			payment_method_id: matched.payment_method_id.clone(),
			amount: matched.amount,
			confirmations: matched.confirmations,
			settled_at: current_timestamp(),
		};

		// A credited transfer always has a record.
		self.storage
			.store(StorageKey::Settlements, &record_key, &record)
			.await?;
		if let Err(e) = self
			.storage
			.store(StorageKey::Invoices, &matched.account_id, &invoices)
			.await
		{
			if let Err(rollback) = self
				.storage
				.remove(StorageKey::Settlements, &record_key)
				.await
			{
				tracing::error!(
					transfer = %record_key,
					error = %rollback,
					"Failed to roll back settlement record"
				);
			}
			return Err(e.into());
		}

		Ok(SettlementOutcome::Applied)
	}

	async fn is_settled(&self, transfer: &TransferRef) -> Result<bool, SourceError> {
		Ok(self
			.storage
			.exists(StorageKey::Settlements, &transfer.to_string())
			.await?)
	}
}
