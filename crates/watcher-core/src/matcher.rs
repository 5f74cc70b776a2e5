//! Invoice matcher.
//!
//! Pairs observed transfers with the outstanding payment methods of open
//! invoices. A transfer qualifies for a method when it covers the due amount
//! within a 1% tolerance and has reached the account's confirmation depth.
//! Each payment method receives at most one match per run, and each transfer
//! is credited to at most one method.

use crate::confirmation::{confirmations, ConfirmationCheckFailure};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use watcher_chain::ChainInterface;
use watcher_types::{Account, Invoice, Match, TokenIdentity, TransactionHash, Transfer, TransferRef};

/// A transfer that covers a payment method but is not deep enough yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPayment {
	pub invoice_id: String,
	pub payment_method_id: String,
	pub transfer: TransferRef,
	pub confirmations: u64,
}

/// Result of one matcher run.
#[derive(Debug, Default)]
pub struct MatchReport {
	pub matches: Vec<Match>,
	pub pending: Vec<PendingPayment>,
}

/// Share of the due amount a payer may fall short by (1%).
fn tolerance(due: Decimal) -> Decimal {
	due * Decimal::new(1, 2)
}

/// Matches transfers against the open invoices of `account`.
///
/// Transfers are considered by ascending block height, keeping scanner order
/// for transfers in the same block. Transfers in `settled` were credited in an
/// earlier cycle and are never offered again. Confirmation counts are queried
/// only for candidates and are cached for the duration of this call.
pub async fn match_transfers(
	chain: &dyn ChainInterface,
	account: &Account,
	invoices: &[Invoice],
	transfers_by_token: &HashMap<TokenIdentity, Vec<Transfer>>,
	settled: &HashSet<TransferRef>,
) -> Result<MatchReport, ConfirmationCheckFailure> {
	let ordered: HashMap<&TokenIdentity, Vec<&Transfer>> = transfers_by_token
		.iter()
		.map(|(token, transfers)| {
			let mut sorted: Vec<&Transfer> = transfers.iter().collect();
			sorted.sort_by_key(|transfer| transfer.block_number);
			(token, sorted)
		})
		.collect();

	let mut report = MatchReport::default();
	let mut consumed: HashSet<TransferRef> = settled.clone();
	let mut depth_cache: HashMap<TransactionHash, u64> = HashMap::new();

	for invoice in invoices {
		for method in invoice.payment_methods.iter().filter(|m| m.is_outstanding()) {
			let Some(transfers) = ordered.get(&method.token) else {
				continue;
			};
			let threshold = method.due - tolerance(method.due);

			for transfer in transfers {
				let reference = transfer.reference();
				if consumed.contains(&reference) || transfer.amount < threshold {
					continue;
				}

				let depth = match depth_cache.get(&transfer.tx_hash) {
					Some(depth) => *depth,
					None => {
						let depth = confirmations(chain, &transfer.tx_hash).await?;
						depth_cache.insert(transfer.tx_hash.clone(), depth);
						depth
					},
				};

				if depth < account.confirmation_depth {
					report.pending.push(PendingPayment {
						invoice_id: invoice.id.clone(),
						payment_method_id: method.id.clone(),
						transfer: reference,
						confirmations: depth,
					});
					continue;
				}

				consumed.insert(reference);
				report.matches.push(Match {
					account_id: account.id.clone(),
					invoice_id: invoice.id.clone(),
					payment_method_id: method.id.clone(),
					transfer: (*transfer).clone(),
					amount: transfer.amount,
					confirmations: depth,
				});
				break;
			}
		}
	}

	Ok(report)
}
