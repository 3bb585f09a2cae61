//! A set of helpers for testing

mod block;
mod wire;

pub use block::{IndexedBlockBuilder, IndexedTransactionBuilder};
pub use wire::{BlockViewBuilder, ChunkViewBuilder, OutcomeBuilder, TransactionViewBuilder};
