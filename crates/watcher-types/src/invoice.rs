//! Invoice types consumed from the invoice source.
//!
//! Invoices are owned by an external invoicing system. The watcher reads them,
//! decides which transfers pay them, and reports matches; it never mutates them
//! itself.

use crate::TokenIdentity;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An invoice awaiting payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
	pub id: String,
	/// Accepted payment methods, in the order they should be considered.
	pub payment_methods: Vec<PaymentMethod>,
}

/// One way of paying an invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMethod {
	/// Identifier of the method within the invoice (e.g. "ETH-USDT-ERC20").
	pub id: String,
	pub token: TokenIdentity,
	/// Remaining unpaid amount, in whole token units.
	pub due: Decimal,
	/// Currency precision used when rendering amounts for this method.
	pub precision: u32,
}

impl PaymentMethod {
	pub fn is_outstanding(&self) -> bool {
		self.due > Decimal::ZERO
	}

	/// Due amount rounded to the method's display precision.
	pub fn display_due(&self) -> String {
		self.due.round_dp(self.precision).to_string()
	}
}

impl Invoice {
	/// Returns true when at least one method still has something due.
	pub fn is_open(&self) -> bool {
		self.payment_methods.iter().any(PaymentMethod::is_outstanding)
	}

	pub fn method(&self, method_id: &str) -> Option<&PaymentMethod> {
		self.payment_methods.iter().find(|m| m.id == method_id)
	}

	pub fn method_mut(&mut self, method_id: &str) -> Option<&mut PaymentMethod> {
		self.payment_methods.iter_mut().find(|m| m.id == method_id)
	}
}
