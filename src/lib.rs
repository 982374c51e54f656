//! Multi-chain ECDSA nonce-reuse monitor.
//!
//! Watches ~20 EVM chains for transactions whose signatures share an R
//! value, logs every collision, and recovers private keys whenever the
//! algebra allows: directly for same-key reuse, via known nonces for
//! cross-key reuse, and through a Gaussian-elimination solver for larger
//! collision graphs.

pub mod api;
pub mod collision;
pub mod config;
pub mod linear;
pub mod logbuf;
pub mod math;
pub mod notify;
pub mod recovery;
pub mod retry;
pub mod rpc;
pub mod scanner;
pub mod storage;
