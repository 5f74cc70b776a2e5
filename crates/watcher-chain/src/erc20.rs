//! ERC-20 ABI fragments used by the watcher.

use alloy_sol_types::sol;

sol! {
	/// Emitted by token contracts on every balance movement.
	event Transfer(address indexed from, address indexed to, uint256 value);

	/// Token balance query.
	function balanceOf(address owner) external view returns (uint256 balance);
}
