//! Typed access to NEAR JSON-RPC endpoints: wire views, a retrying client,
//! a height-pinned view for mapping handlers, and the multi-endpoint pool.

pub mod client;
pub mod pool;
pub mod safe;
pub mod types;

pub use client::{JsonRpcClient, RpcClientError};
pub use pool::{ApiPool, NetworkMeta, PoolError};
pub use safe::SafeRpcClient;
