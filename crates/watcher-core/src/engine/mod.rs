//! Scan orchestrator for the payment watcher.
//!
//! Each account gets its own periodic job. A job runs one scan cycle (open
//! invoices, chain scan per accepted token, matching, settlement) and then
//! waits the account's full scan interval before the next one, whether the
//! cycle succeeded or not. Jobs share one chain client and a semaphore that
//! bounds how many cycles run at the same time. A supervisor reloads the
//! account list periodically and starts or stops jobs to follow it.

pub mod event_bus;
pub mod lifecycle;
pub mod schedule;

use crate::confirmation::ConfirmationCheckFailure;
use crate::matcher::match_transfers;
use crate::sources::{AccountSource, InvoiceSource, SettlementSink, SourceError};
use event_bus::EventBus;
use futures::future::{join_all, try_join_all};
use schedule::run_every;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::instrument;
use watcher_chain::{ChainError, ChainService};
use watcher_config::Config;
use watcher_scanner::{scan, ScanFailure};
use watcher_storage::StorageService;
use watcher_types::{
	truncate_id, Account, PaymentEvent, ScanEvent, SettlementOutcome, TokenIdentity, Transfer,
	TransferRef, WatcherEvent,
};

/// Errors that end an account's scan cycle.
#[derive(Debug, Error)]
pub enum EngineError {
	/// The account cannot be scanned as configured.
	#[error("Configuration error: {0}")]
	Configuration(String),
	#[error("Chain error: {0}")]
	Chain(#[from] ChainError),
	#[error("Scan of {token} failed: {source}")]
	Scan {
		token: String,
		#[source]
		source: ScanFailure,
	},
	#[error("Confirmation check failed: {0}")]
	Confirmation(#[from] ConfirmationCheckFailure),
	#[error("Source error: {0}")]
	Source(#[from] SourceError),
	/// The settlement sink declined a match.
	#[error("Settlement of {transfer} for invoice {invoice_id} rejected: {reason}")]
	SettlementRejected {
		invoice_id: String,
		transfer: String,
		reason: String,
	},
}

/// Result of one account scan cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
	/// No open invoices; the chain was not queried.
	Skipped,
	Completed {
		from_block: u64,
		to_block: u64,
		transfers: usize,
		matches: usize,
		settled: usize,
	},
	Failed(String),
}

/// Block range to scan for `account` when the chain tip is at `latest`.
///
/// The range always covers the last `lookback` blocks. If the account has a
/// cursor, it also reaches back `confirmation_depth` blocks below the cursor
/// so that transfers which were still shallow in the previous cycle are seen
/// again. The start never lies more than `max_catchup` blocks behind `latest`.
pub fn scan_window(latest: u64, lookback: u64, max_catchup: u64, account: &Account) -> (u64, u64) {
	let lookback_start = latest.saturating_sub(lookback);
	let from_block = match account.last_scanned_block {
		Some(cursor) => lookback_start.min(cursor.saturating_sub(account.confirmation_depth)),
		None => lookback_start,
	};
	(from_block.max(latest.saturating_sub(max_catchup)), latest)
}

struct ScanJob {
	/// Account settings the job was started with, cursor excluded.
	settings: Account,
	stop: watch::Sender<bool>,
	handle: JoinHandle<()>,
}

/// Main watcher engine.
#[derive(Clone)]
pub struct WatcherEngine {
	pub(crate) config: Config,
	pub(crate) chain: ChainService,
	pub(crate) storage: Arc<StorageService>,
	pub(crate) accounts: Arc<dyn AccountSource>,
	pub(crate) invoices: Arc<dyn InvoiceSource>,
	pub(crate) settlement: Arc<dyn SettlementSink>,
	pub(crate) event_bus: EventBus,
	scan_permits: Arc<Semaphore>,
}

impl WatcherEngine {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		config: Config,
		chain: ChainService,
		storage: Arc<StorageService>,
		accounts: Arc<dyn AccountSource>,
		invoices: Arc<dyn InvoiceSource>,
		settlement: Arc<dyn SettlementSink>,
		event_bus: EventBus,
	) -> Self {
		let scan_permits = Arc::new(Semaphore::new(config.watcher.max_concurrent_scans));
		Self {
			config,
			chain,
			storage,
			accounts,
			invoices,
			settlement,
			event_bus,
			scan_permits,
		}
	}

	/// Runs the watcher until `shutdown` turns true.
	///
	/// Cycles in progress are allowed to finish before this returns.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
		self.initialize().await;

		let storage = self.storage.clone();
		let cleanup_handle = tokio::spawn(run_every(
			Duration::from_secs(self.config.storage.cleanup_interval_seconds),
			shutdown.clone(),
			move || {
				let storage = storage.clone();
				async move {
					match storage.cleanup_expired().await {
						Ok(count) if count > 0 => {
							tracing::debug!("Storage cleanup: removed {} expired entries", count);
						},
						Err(e) => {
							tracing::warn!("Storage cleanup failed: {}", e);
						},
						_ => {},
					}
				}
			},
		));

		let mut jobs: HashMap<String, ScanJob> = HashMap::new();
		let mut refresh = tokio::time::interval(Duration::from_secs(
			self.config.watcher.account_refresh_seconds,
		));
		refresh.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				_ = refresh.tick() => {
					self.reconcile_jobs(&mut jobs).await;
				}
				changed = shutdown.changed() => {
					if changed.is_err() || *shutdown.borrow() {
						break;
					}
				}
			}
		}

		for job in jobs.values() {
			let _ = job.stop.send(true);
		}
		for (account_id, job) in jobs {
			if let Err(e) = job.handle.await {
				tracing::warn!(account_id = %account_id, "Scan job ended abnormally: {}", e);
			}
		}
		if let Err(e) = cleanup_handle.await {
			tracing::warn!("Cleanup job ended abnormally: {}", e);
		}

		self.shutdown().await;
		Ok(())
	}

	/// Starts, restarts and stops per-account jobs to follow the account source.
	async fn reconcile_jobs(&self, jobs: &mut HashMap<String, ScanJob>) {
		let accounts = match self.accounts.accounts().await {
			Ok(accounts) => accounts,
			Err(e) => {
				tracing::warn!("Failed to load accounts, keeping current jobs: {}", e);
				return;
			},
		};

		jobs.retain(|account_id, job| {
			let keep = accounts.iter().any(|account| &account.id == account_id);
			if !keep {
				let _ = job.stop.send(true);
				tracing::info!(account_id = %account_id, "Stopped watching account");
			}
			keep
		});

		for account in accounts {
			let settings = Account {
				last_scanned_block: None,
				..account
			};
			let previous = match jobs.remove(&settings.id) {
				Some(job) if job.settings == settings && !job.handle.is_finished() => {
					jobs.insert(settings.id.clone(), job);
					continue;
				},
				Some(job) => {
					let _ = job.stop.send(true);
					tracing::info!(account_id = %settings.id, "Account settings changed, restarting job");
					Some(job.handle)
				},
				None => None,
			};

			let (stop, stop_rx) = watch::channel(false);
			let handle = self.spawn_account_job(&settings, stop_rx, previous);
			tracing::info!(
				account_id = %settings.id,
				interval_secs = settings.scan_interval.as_secs(),
				tokens = settings.tokens.len(),
				"Watching account"
			);
			jobs.insert(
				settings.id.clone(),
				ScanJob {
					settings,
					stop,
					handle,
				},
			);
		}
	}

	/// Spawns the periodic job for `account`.
	///
	/// When `previous` is the job being replaced, its cycle in progress finishes
	/// before the new job's first cycle, so one account never has two cycles
	/// running at once.
	fn spawn_account_job(
		&self,
		account: &Account,
		stop: watch::Receiver<bool>,
		previous: Option<JoinHandle<()>>,
	) -> JoinHandle<()> {
		let engine = self.clone();
		let account_id = account.id.clone();
		let interval = account.scan_interval;
		tokio::spawn(async move {
			if let Some(previous) = previous {
				if let Err(e) = previous.await {
					tracing::warn!(account_id = %account_id, "Replaced scan job ended abnormally: {}", e);
				}
			}
			run_every(interval, stop, move || {
				let engine = engine.clone();
				let account_id = account_id.clone();
				async move { engine.tick(&account_id).await }
			})
			.await
		})
	}

	/// One scheduled cycle: reloads the account, then scans it.
	async fn tick(&self, account_id: &str) {
		let Ok(_permit) = self.scan_permits.acquire().await else {
			return;
		};

		match self.accounts.account(account_id).await {
			Ok(Some(account)) => {
				self.run_cycle(&account).await;
			},
			Ok(None) => {
				tracing::debug!(account_id = %account_id, "Account no longer configured");
			},
			Err(e) => {
				tracing::error!(account_id = %account_id, "Failed to load account: {}", e);
				self.event_bus.publish(WatcherEvent::Scan(ScanEvent::Failed {
					account_id: account_id.to_string(),
					error: e.to_string(),
				}));
			},
		}
	}

	/// Scans every account once, concurrently within the scan limit.
	pub async fn scan_all_once(&self) -> Result<Vec<(String, CycleOutcome)>, EngineError> {
		let accounts = self.accounts.accounts().await?;
		let cycles = accounts.iter().map(|account| async move {
			let _permit = self.scan_permits.acquire().await.ok();
			(account.id.clone(), self.run_cycle(account).await)
		});
		Ok(join_all(cycles).await)
	}

	/// Runs one cycle for `account`, turning any error into a failed outcome.
	#[instrument(skip_all, fields(account_id = %account.id))]
	pub async fn run_cycle(&self, account: &Account) -> CycleOutcome {
		match self.scan_account(account).await {
			Ok(outcome) => {
				let event = match &outcome {
					CycleOutcome::Skipped => ScanEvent::Skipped {
						account_id: account.id.clone(),
					},
					CycleOutcome::Completed {
						from_block,
						to_block,
						transfers,
						matches,
						..
					} => ScanEvent::Completed {
						account_id: account.id.clone(),
						from_block: *from_block,
						to_block: *to_block,
						transfers: *transfers,
						matches: *matches,
					},
					CycleOutcome::Failed(error) => ScanEvent::Failed {
						account_id: account.id.clone(),
						error: error.clone(),
					},
				};
				self.event_bus.publish(WatcherEvent::Scan(event));
				outcome
			},
			Err(e) => {
				match &e {
					EngineError::Configuration(_) => {
						tracing::warn!(error = %e, "Account skipped until its configuration is fixed")
					},
					_ => tracing::error!(error = %e, "Scan cycle failed"),
				}
				self.event_bus.publish(WatcherEvent::Scan(ScanEvent::Failed {
					account_id: account.id.clone(),
					error: e.to_string(),
				}));
				CycleOutcome::Failed(e.to_string())
			},
		}
	}

	async fn scan_account(&self, account: &Account) -> Result<CycleOutcome, EngineError> {
		let receiving_address = account
			.parse_receiving_address()
			.map_err(EngineError::Configuration)?;
		account.check_tokens().map_err(EngineError::Configuration)?;

		let invoices = self.invoices.open_invoices(&account.id).await?;
		if invoices.is_empty() {
			tracing::debug!("No open invoices, skipping");
			return Ok(CycleOutcome::Skipped);
		}

		let latest = self.chain.latest_height().await?;
		let (from_block, to_block) = scan_window(
			latest,
			self.config.watcher.lookback_blocks,
			self.config.watcher.max_catchup_blocks,
			account,
		);
		tracing::debug!(from_block, to_block, invoices = invoices.len(), "Scanning");

		let chain = self.chain.client();
		let scans = account.tokens.iter().map(|token| async move {
			scan(chain, token, receiving_address, from_block, to_block)
				.await
				.map(|transfers| (token.clone(), transfers))
				.map_err(|source| EngineError::Scan {
					token: token.to_string(),
					source,
				})
		});
		let transfers_by_token: HashMap<TokenIdentity, Vec<Transfer>> =
			try_join_all(scans).await?.into_iter().collect();
		let transfers: usize = transfers_by_token.values().map(Vec::len).sum();

		let settled = self.settled_transfers(&transfers_by_token).await?;
		let report =
			match_transfers(chain, account, &invoices, &transfers_by_token, &settled).await?;

		for pending in report.pending {
			tracing::debug!(
				invoice_id = %pending.invoice_id,
				tx_hash = %truncate_id(&pending.transfer.tx_hash.to_hex()),
				confirmations = pending.confirmations,
				required = account.confirmation_depth,
				"Payment awaiting confirmations"
			);
			self.event_bus
				.publish(WatcherEvent::Payment(PaymentEvent::Pending {
					account_id: account.id.clone(),
					invoice_id: pending.invoice_id,
					transfer: pending.transfer,
					confirmations: pending.confirmations,
					required: account.confirmation_depth,
				}));
		}

		let matches = report.matches.len();
		let mut settled = 0;
		for matched in report.matches {
			let reference = matched.transfer.reference();
			tracing::info!(
				invoice_id = %matched.invoice_id,
				payment_method = %matched.payment_method_id,
				tx_hash = %truncate_id(&reference.tx_hash.to_hex()),
				amount = %matched.amount,
				confirmations = matched.confirmations,
				"Payment detected"
			);
			self.event_bus
				.publish(WatcherEvent::Payment(PaymentEvent::Matched {
					account_id: account.id.clone(),
					matched: matched.clone(),
				}));

			match self.settlement.apply(&matched).await? {
				SettlementOutcome::Rejected { reason } => {
					let rejection = EngineError::SettlementRejected {
						invoice_id: matched.invoice_id.clone(),
						transfer: reference.to_string(),
						reason: reason.clone(),
					};
					tracing::warn!(error = %rejection, "Match not settled");
					self.event_bus
						.publish(WatcherEvent::Payment(PaymentEvent::Rejected {
							account_id: account.id.clone(),
							invoice_id: matched.invoice_id,
							transfer: reference,
							reason,
						}));
				},
				outcome => {
					if outcome == SettlementOutcome::Applied {
						settled += 1;
					}
					self.event_bus
						.publish(WatcherEvent::Payment(PaymentEvent::Settled {
							account_id: account.id.clone(),
							invoice_id: matched.invoice_id,
							transfer: reference,
							outcome,
						}));
				},
			}
		}

		self.accounts
			.record_scanned_height(&account.id, to_block)
			.await?;

		Ok(CycleOutcome::Completed {
			from_block,
			to_block,
			transfers,
			matches,
			settled,
		})
	}

	/// Transfers in the window that the sink already credited.
	async fn settled_transfers(
		&self,
		transfers_by_token: &HashMap<TokenIdentity, Vec<Transfer>>,
	) -> Result<HashSet<TransferRef>, SourceError> {
		let mut settled = HashSet::new();
		for transfer in transfers_by_token.values().flatten() {
			let reference = transfer.reference();
			if self.settlement.is_settled(&reference).await? {
				settled.insert(reference);
			}
		}
		Ok(settled)
	}

	/// Returns a reference to the event bus.
	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	/// Returns a reference to the configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the chain service.
	pub fn chain(&self) -> &ChainService {
		&self.chain
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sources::{ConfigAccountSource, StorageInvoiceSource, StorageSettlementSink};
	use alloy_primitives::{Address, U256};
	use alloy_sol_types::SolEvent;
	use async_trait::async_trait;
	use rust_decimal::Decimal;
	use std::str::FromStr;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex as StdMutex;
	use watcher_chain::erc20::Transfer as TransferEvent;
	use watcher_chain::implementations::mock::MockChain;
	use watcher_chain::ChainInterface;
	use watcher_config::builders::ConfigBuilder;
	use watcher_storage::implementations::memory::MemoryStorage;
	use watcher_types::{
		utils::address_topic, Block, ChainTransaction, ConfigSchema, Invoice, Match,
		PaymentMethod, RawLog, Receipt, TransactionHash,
	};

	const TIP: u64 = 5_000;
	const STORE: Address = Address::new([0x01; 20]);
	const OTHER_STORE: Address = Address::new([0x03; 20]);
	const PAYER: Address = Address::new([0x02; 20]);
	const USDT: Address = Address::new([0x11; 20]);

	fn usdt() -> TokenIdentity {
		TokenIdentity::erc20(USDT, 6, "USDT")
	}

	fn dec(s: &str) -> Decimal {
		Decimal::from_str(s).unwrap()
	}

	fn invoice(id: &str, token: TokenIdentity, due: &str) -> Invoice {
		Invoice {
			id: id.into(),
			payment_methods: vec![PaymentMethod {
				id: token.symbol().to_string(),
				token,
				due: dec(due),
				precision: 2,
			}],
		}
	}

	struct Harness {
		engine: WatcherEngine,
		chain: Arc<MockChain>,
		accounts: Arc<ConfigAccountSource>,
		invoices: Arc<StorageInvoiceSource>,
	}

	/// Engine over `client`; `chain` is the mock behind it, used for seeding.
	fn harness_on(
		config: Config,
		chain: Arc<MockChain>,
		client: Arc<dyn ChainInterface>,
		sink: impl FnOnce(Arc<StorageService>) -> Arc<dyn SettlementSink>,
	) -> Harness {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let accounts = Arc::new(ConfigAccountSource::new(config.accounts(), storage.clone()));
		let invoices = Arc::new(StorageInvoiceSource::new(storage.clone()));
		let engine = WatcherEngine::new(
			config,
			ChainService::new(client),
			storage.clone(),
			accounts.clone(),
			invoices.clone(),
			sink(storage),
			EventBus::new(64),
		);
		Harness {
			engine,
			chain,
			accounts,
			invoices,
		}
	}

	fn storage_sink(storage: Arc<StorageService>) -> Arc<dyn SettlementSink> {
		Arc::new(StorageSettlementSink::new(storage))
	}

	fn harness_with_sink(
		config: Config,
		sink: impl FnOnce(Arc<StorageService>) -> Arc<dyn SettlementSink>,
	) -> Harness {
		let chain = Arc::new(MockChain::new(TIP));
		harness_on(config, chain.clone(), chain, sink)
	}

	fn harness(config: Config) -> Harness {
		harness_with_sink(config, storage_sink)
	}

	/// Holds every Transfer log query open for `delay` and records the
	/// highest number of queries in flight at once.
	struct SlowLogsChain {
		inner: Arc<MockChain>,
		delay: Duration,
		in_flight: AtomicUsize,
		peak: AtomicUsize,
		queries: AtomicUsize,
	}

	impl SlowLogsChain {
		fn new(inner: Arc<MockChain>, delay: Duration) -> Self {
			Self {
				inner,
				delay,
				in_flight: AtomicUsize::new(0),
				peak: AtomicUsize::new(0),
				queries: AtomicUsize::new(0),
			}
		}
	}

	#[async_trait]
	impl ChainInterface for SlowLogsChain {
		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			self.inner.config_schema()
		}

		async fn latest_height(&self) -> Result<u64, ChainError> {
			self.inner.latest_height().await
		}

		async fn block_with_transactions(&self, height: u64) -> Result<Option<Block>, ChainError> {
			self.inner.block_with_transactions(height).await
		}

		async fn transfer_event_logs(
			&self,
			contract: Address,
			recipient: Address,
			from_block: u64,
			to_block: u64,
		) -> Result<Vec<RawLog>, ChainError> {
			self.queries.fetch_add(1, Ordering::SeqCst);
			let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
			self.peak.fetch_max(now, Ordering::SeqCst);
			tokio::time::sleep(self.delay).await;
			let logs = self
				.inner
				.transfer_event_logs(contract, recipient, from_block, to_block)
				.await;
			self.in_flight.fetch_sub(1, Ordering::SeqCst);
			logs
		}

		async fn transaction_receipt(
			&self,
			hash: &TransactionHash,
		) -> Result<Option<Receipt>, ChainError> {
			self.inner.transaction_receipt(hash).await
		}

		async fn balance(&self, address: Address, token: &TokenIdentity) -> Result<U256, ChainError> {
			self.inner.balance(address, token).await
		}
	}

	/// Seeds an ERC-20 Transfer into `to` at `block`, with a matching receipt.
	async fn seed_usdt_transfer(chain: &MockChain, to: Address, raw: u64, block: u64, tx: u8) {
		let hash = TransactionHash(vec![tx; 32]);
		chain
			.add_log(RawLog {
				address: USDT,
				topics: vec![
					TransferEvent::SIGNATURE_HASH,
					address_topic(PAYER),
					address_topic(to),
				],
				data: U256::from(raw).to_be_bytes::<32>().to_vec(),
				transaction_hash: Some(hash.clone()),
				block_number: Some(block),
				log_index: Some(0),
			})
			.await;
		chain.set_receipt(hash, Some(block)).await;
	}

	fn account(id: &str, cursor: Option<u64>, depth: u64) -> Account {
		Account {
			id: id.into(),
			receiving_address: STORE.to_string(),
			tokens: vec![usdt()],
			confirmation_depth: depth,
			scan_interval: Duration::from_secs(15),
			last_scanned_block: cursor,
		}
	}

	#[test]
	fn test_scan_window() {
		// Fresh account: plain lookback.
		assert_eq!(scan_window(5_000, 1_000, 10_000, &account("a", None, 12)), (4_000, 5_000));
		// Recent cursor stays inside the lookback window.
		assert_eq!(
			scan_window(5_000, 1_000, 10_000, &account("a", Some(4_990), 12)),
			(4_000, 5_000)
		);
		// After an outage the window reaches back below the cursor.
		assert_eq!(
			scan_window(5_000, 1_000, 10_000, &account("a", Some(2_500), 12)),
			(2_488, 5_000)
		);
		// Never further back than the catch-up limit.
		assert_eq!(
			scan_window(50_000, 1_000, 10_000, &account("a", Some(100), 12)),
			(40_000, 50_000)
		);
		// Young chain.
		assert_eq!(scan_window(300, 1_000, 10_000, &account("a", None, 12)), (0, 300));
	}

	#[tokio::test]
	async fn test_no_open_invoices_means_no_chain_calls() {
		let config = ConfigBuilder::new()
			.account("store-1", STORE.to_string(), 12, vec![usdt(), TokenIdentity::Native])
			.build();
		let h = harness(config);
		let mut events = h.engine.event_bus().subscribe();

		let outcomes = h.engine.scan_all_once().await.unwrap();

		assert_eq!(outcomes, vec![("store-1".to_string(), CycleOutcome::Skipped)]);
		assert_eq!(h.chain.calls().total(), 0);
		assert!(matches!(
			events.recv().await.unwrap(),
			WatcherEvent::Scan(ScanEvent::Skipped { .. })
		));
	}

	#[tokio::test]
	async fn test_payment_is_matched_settled_and_cursor_recorded() {
		let config = ConfigBuilder::new()
			.account("store-1", STORE.to_string(), 12, vec![usdt()])
			.build();
		let h = harness(config);
		h.invoices
			.upsert("store-1", invoice("inv-1", usdt(), "100.00"))
			.await
			.unwrap();
		seed_usdt_transfer(&h.chain, STORE, 99_500_000, TIP - 12, 1).await;

		let outcomes = h.engine.scan_all_once().await.unwrap();

		assert_eq!(
			outcomes[0].1,
			CycleOutcome::Completed {
				from_block: TIP - 1_000,
				to_block: TIP,
				transfers: 1,
				matches: 1,
				settled: 1,
			}
		);
		assert!(h.invoices.open_invoices("store-1").await.unwrap().is_empty());
		let account = h.accounts.account("store-1").await.unwrap().unwrap();
		assert_eq!(account.last_scanned_block, Some(TIP));

		// Paid invoice: next cycle does not touch the chain.
		let calls = h.chain.calls().total();
		let outcomes = h.engine.scan_all_once().await.unwrap();
		assert_eq!(outcomes[0].1, CycleOutcome::Skipped);
		assert_eq!(h.chain.calls().total(), calls);
	}

	#[tokio::test]
	async fn test_shallow_payment_matches_once_deep_enough() {
		let config = ConfigBuilder::new()
			.account("store-1", STORE.to_string(), 12, vec![usdt()])
			.build();
		let h = harness(config);
		let mut events = h.engine.event_bus().subscribe();
		h.invoices
			.upsert("store-1", invoice("inv-1", usdt(), "100"))
			.await
			.unwrap();
		seed_usdt_transfer(&h.chain, STORE, 100_000_000, TIP - 11, 1).await;

		let outcomes = h.engine.scan_all_once().await.unwrap();
		assert!(matches!(
			outcomes[0].1,
			CycleOutcome::Completed { matches: 0, .. }
		));
		assert!(matches!(
			events.recv().await.unwrap(),
			WatcherEvent::Payment(PaymentEvent::Pending {
				confirmations: 11,
				required: 12,
				..
			})
		));

		h.chain.set_latest(TIP + 1).await;
		let outcomes = h.engine.scan_all_once().await.unwrap();
		assert!(matches!(
			outcomes[0].1,
			CycleOutcome::Completed {
				matches: 1,
				settled: 1,
				..
			}
		));
	}

	#[tokio::test]
	async fn test_failing_account_does_not_affect_others() {
		let config = ConfigBuilder::new()
			.lookback_blocks(100)
			.account("native-store", OTHER_STORE.to_string(), 12, vec![TokenIdentity::Native])
			.account("usdt-store", STORE.to_string(), 12, vec![usdt()])
			.build();
		let h = harness(config);
		h.invoices
			.upsert("native-store", invoice("inv-n", TokenIdentity::Native, "1"))
			.await
			.unwrap();
		h.invoices
			.upsert("usdt-store", invoice("inv-u", usdt(), "5"))
			.await
			.unwrap();
		h.chain.fail_block(TIP - 50).await;
		seed_usdt_transfer(&h.chain, STORE, 5_000_000, TIP - 20, 7).await;

		let outcomes: HashMap<_, _> = h.engine.scan_all_once().await.unwrap().into_iter().collect();

		assert!(matches!(outcomes["native-store"], CycleOutcome::Failed(_)));
		assert!(matches!(
			outcomes["usdt-store"],
			CycleOutcome::Completed { matches: 1, .. }
		));
		let failed = h.accounts.account("native-store").await.unwrap().unwrap();
		assert_eq!(failed.last_scanned_block, None);
	}

	#[tokio::test]
	async fn test_native_payment_end_to_end() {
		let config = ConfigBuilder::new()
			.lookback_blocks(100)
			.account("store-1", STORE.to_string(), 3, vec![TokenIdentity::Native])
			.build();
		let h = harness(config);
		h.invoices
			.upsert("store-1", invoice("inv-1", TokenIdentity::Native, "0.25"))
			.await
			.unwrap();
		let hash = TransactionHash(vec![9; 32]);
		h.chain
			.add_block(Block {
				number: TIP - 5,
				timestamp: Some(1_700_000_000),
				transactions: vec![ChainTransaction {
					hash: hash.clone(),
					from: PAYER,
					to: Some(STORE),
					value: U256::from(250_000_000_000_000_000u64),
				}],
			})
			.await;
		h.chain.set_receipt(hash, Some(TIP - 5)).await;

		let outcomes = h.engine.scan_all_once().await.unwrap();

		assert!(matches!(
			outcomes[0].1,
			CycleOutcome::Completed { matches: 1, .. }
		));
		assert_eq!(h.chain.calls().blocks, 101);
	}

	#[tokio::test]
	async fn test_invalid_receiving_address_fails_without_chain_calls() {
		let config = ConfigBuilder::new()
			.account("store-1", "not-an-address", 12, vec![usdt()])
			.build();
		let h = harness(config);
		h.invoices
			.upsert("store-1", invoice("inv-1", usdt(), "1"))
			.await
			.unwrap();

		let outcomes = h.engine.scan_all_once().await.unwrap();

		match &outcomes[0].1 {
			CycleOutcome::Failed(error) => assert!(error.contains("receiving address")),
			other => panic!("unexpected outcome {:?}", other),
		}
		assert_eq!(h.chain.calls().total(), 0);
	}

	struct RejectingSink;

	#[async_trait]
	impl SettlementSink for RejectingSink {
		async fn apply(&self, _matched: &Match) -> Result<SettlementOutcome, SourceError> {
			Ok(SettlementOutcome::Rejected {
				reason: "invoice locked".into(),
			})
		}

		async fn is_settled(&self, _transfer: &TransferRef) -> Result<bool, SourceError> {
			Ok(false)
		}
	}

	#[tokio::test]
	async fn test_rejected_settlement_is_reported() {
		let config = ConfigBuilder::new()
			.account("store-1", STORE.to_string(), 0, vec![usdt()])
			.build();
		let h = harness_with_sink(config, |_| Arc::new(RejectingSink) as Arc<dyn SettlementSink>);
		let mut events = h.engine.event_bus().subscribe();
		h.invoices
			.upsert("store-1", invoice("inv-1", usdt(), "10"))
			.await
			.unwrap();
		seed_usdt_transfer(&h.chain, STORE, 10_000_000, TIP, 1).await;

		let outcomes = h.engine.scan_all_once().await.unwrap();
		assert!(matches!(
			outcomes[0].1,
			CycleOutcome::Completed {
				matches: 1,
				settled: 0,
				..
			}
		));

		let mut rejected = false;
		while let Ok(event) = events.try_recv() {
			if let WatcherEvent::Payment(PaymentEvent::Rejected { reason, .. }) = event {
				assert_eq!(reason, "invoice locked");
				rejected = true;
			}
		}
		assert!(rejected);
		// Invoice untouched, so the transfer is reconsidered next cycle.
		assert_eq!(h.invoices.open_invoices("store-1").await.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn test_run_until_shutdown() {
		let config = ConfigBuilder::new()
			.account("store-1", STORE.to_string(), 12, vec![usdt()])
			.build();
		let h = harness(config);
		let mut events = h.engine.event_bus().subscribe();
		h.invoices
			.upsert("store-1", invoice("inv-1", usdt(), "100"))
			.await
			.unwrap();
		seed_usdt_transfer(&h.chain, STORE, 100_000_000, TIP - 20, 1).await;

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let engine = h.engine.clone();
		let running = tokio::spawn(async move { engine.run(shutdown_rx).await });

		let settled = tokio::time::timeout(Duration::from_secs(10), async {
			loop {
				if let Ok(WatcherEvent::Payment(PaymentEvent::Settled { outcome, .. })) =
					events.recv().await
				{
					return outcome;
				}
			}
		})
		.await
		.unwrap();
		assert_eq!(settled, SettlementOutcome::Applied);

		shutdown_tx.send(true).unwrap();
		tokio::time::timeout(Duration::from_secs(10), running)
			.await
			.unwrap()
			.unwrap()
			.unwrap();
	}

	#[tokio::test]
	async fn test_settled_transfer_does_not_block_next_invoice() {
		let config = ConfigBuilder::new()
			.account("store-1", STORE.to_string(), 12, vec![usdt()])
			.build();
		let h = harness(config);
		h.invoices
			.upsert("store-1", invoice("inv-a", usdt(), "100"))
			.await
			.unwrap();
		h.invoices
			.upsert("store-1", invoice("inv-b", usdt(), "100"))
			.await
			.unwrap();
		seed_usdt_transfer(&h.chain, STORE, 100_000_000, TIP - 40, 1).await;

		let outcomes = h.engine.scan_all_once().await.unwrap();
		assert!(matches!(
			outcomes[0].1,
			CycleOutcome::Completed { settled: 1, .. }
		));
		let open = h.invoices.open_invoices("store-1").await.unwrap();
		assert_eq!(open.len(), 1);
		assert_eq!(open[0].id, "inv-b");

		// inv-b's own payment arrives; the earlier, settled transfer stays in the window.
		seed_usdt_transfer(&h.chain, STORE, 100_000_000, TIP - 30, 2).await;
		let outcomes = h.engine.scan_all_once().await.unwrap();

		assert_eq!(
			outcomes[0].1,
			CycleOutcome::Completed {
				from_block: TIP - 1_000,
				to_block: TIP,
				transfers: 2,
				matches: 1,
				settled: 1,
			}
		);
		assert!(h.invoices.open_invoices("store-1").await.unwrap().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_scan_limit_bounds_concurrent_cycles() {
		for (limit, expected_peak) in [(1, 1), (2, 2)] {
			let config = ConfigBuilder::new()
				.max_concurrent_scans(limit)
				.account("store-a", STORE.to_string(), 12, vec![usdt()])
				.account("store-b", OTHER_STORE.to_string(), 12, vec![usdt()])
				.build();
			let mock = Arc::new(MockChain::new(TIP));
			let slow = Arc::new(SlowLogsChain::new(mock.clone(), Duration::from_secs(5)));
			let h = harness_on(config, mock, slow.clone(), storage_sink);
			for account_id in ["store-a", "store-b"] {
				h.invoices
					.upsert(account_id, invoice("inv-1", usdt(), "100"))
					.await
					.unwrap();
			}

			let outcomes = h.engine.scan_all_once().await.unwrap();

			assert!(outcomes
				.iter()
				.all(|(_, outcome)| matches!(outcome, CycleOutcome::Completed { .. })));
			assert_eq!(slow.queries.load(Ordering::SeqCst), 2);
			assert_eq!(slow.peak.load(Ordering::SeqCst), expected_peak);
		}
	}

	/// Account source whose single account can be edited while the engine runs.
	struct EditableAccounts {
		account: StdMutex<Account>,
	}

	#[async_trait]
	impl AccountSource for EditableAccounts {
		async fn accounts(&self) -> Result<Vec<Account>, SourceError> {
			Ok(vec![self.account.lock().unwrap().clone()])
		}

		async fn record_scanned_height(
			&self,
			_account_id: &str,
			_height: u64,
		) -> Result<(), SourceError> {
			Ok(())
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_restarted_job_waits_for_running_cycle() {
		let config = ConfigBuilder::new().account_refresh_seconds(1).build();
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mock = Arc::new(MockChain::new(TIP));
		let slow = Arc::new(SlowLogsChain::new(mock, Duration::from_secs(5)));
		let accounts = Arc::new(EditableAccounts {
			account: StdMutex::new(account("store-1", None, 12)),
		});
		let invoices = Arc::new(StorageInvoiceSource::new(storage.clone()));
		invoices
			.upsert("store-1", invoice("inv-1", usdt(), "100"))
			.await
			.unwrap();
		let engine = WatcherEngine::new(
			config,
			ChainService::new(slow.clone()),
			storage.clone(),
			accounts.clone(),
			invoices,
			storage_sink(storage),
			EventBus::new(64),
		);

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let running = tokio::spawn(async move { engine.run(shutdown_rx).await });

		// First cycle is inside its log query when the interval changes.
		tokio::time::sleep(Duration::from_secs(2)).await;
		accounts.account.lock().unwrap().scan_interval = Duration::from_secs(20);
		tokio::time::sleep(Duration::from_secs(28)).await;

		shutdown_tx.send(true).unwrap();
		running.await.unwrap().unwrap();

		assert!(slow.queries.load(Ordering::SeqCst) >= 2);
		assert_eq!(slow.peak.load(Ordering::SeqCst), 1);
	}
}
