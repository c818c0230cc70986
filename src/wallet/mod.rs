//! Funding wallet: spendable-output pool and signing key

pub mod allocator;
pub mod spender;

pub use allocator::{AllocError, Utxo, UtxoAllocator};
pub use spender::Spender;
