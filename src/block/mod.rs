//! The unified block model and the assembler that materializes it from
//! chain RPC.

pub mod assembler;
pub mod types;

pub use assembler::{AssemblyError, BlockAssembler};
pub use types::{
    ActionPayload, ActionType, IndexedAction, IndexedBlock, IndexedTransaction,
    InvalidActionError, TransactionRef,
};
