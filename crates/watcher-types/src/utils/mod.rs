//! Utility functions for common type conversions and transformations.

pub mod conversion;
pub mod formatting;
pub mod helpers;

pub use conversion::{address_topic, raw_to_decimal, AmountConversionError};
pub use formatting::{format_token_amount, truncate_id, with_0x_prefix, without_0x_prefix};
pub use helpers::{current_timestamp, payment_uri};
