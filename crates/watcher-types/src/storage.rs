//! Storage namespaces used by the watcher.

use std::str::FromStr;

/// Namespaces for persisted data.
///
/// Keys inside a namespace are the account id (cursors, open invoices) or the
/// transfer reference (settlements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Last scanned block height per account.
	ScanCursors,
	/// Open invoices per account.
	Invoices,
	/// Settlement records keyed by transfer reference.
	Settlements,
}

impl StorageKey {
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::ScanCursors => "scan_cursors",
			StorageKey::Invoices => "invoices",
			StorageKey::Settlements => "settlements",
		}
	}

	pub fn all() -> impl Iterator<Item = Self> {
		[Self::ScanCursors, Self::Invoices, Self::Settlements].into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"scan_cursors" => Ok(Self::ScanCursors),
			"invoices" => Ok(Self::Invoices),
			"settlements" => Ok(Self::Settlements),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
