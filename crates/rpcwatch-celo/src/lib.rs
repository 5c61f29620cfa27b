//! rpcwatch-celo: Celo chain access for RPCWatch.
//!
//! - [`CeloOracle`]: registry, names, memberships and endpoints via `eth_call`
//! - [`HttpRpcClient`]: JSON-RPC over HTTP with retry on transient failures
//! - [`HttpLivenessProbe`]: the `eth_blockNumber` check run against validator endpoints

pub mod contracts;
pub mod error;
pub mod liveness;
pub mod metadata;
pub mod oracle;
pub mod rpc;
pub mod transport;

pub use error::TransportError;
pub use liveness::HttpLivenessProbe;
pub use oracle::CeloOracle;
pub use transport::{HttpClientConfig, HttpRpcClient, RpcTransport};
