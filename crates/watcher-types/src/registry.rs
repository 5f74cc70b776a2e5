//! Registry trait for self-registering implementations.

/// Ties a pluggable implementation to its configuration name and factory.
///
/// Chain clients and storage backends each expose a `Registry` struct so the
/// service binary can build its factory maps without hard-coding names, e.g.
/// `"evm_alloy"` for `[chain.implementations.evm_alloy]` or `"file"` for
/// `[storage.implementations.file]`.
pub trait ImplementationRegistry {
	/// Name used under `implementations` in the TOML configuration.
	const NAME: &'static str;

	/// Factory function type of the owning module.
	type Factory;

	fn factory() -> Self::Factory;
}
