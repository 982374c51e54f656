//! JSON-RPC boundary adapter for the EVM chains.
//!
//! The scanner needs three things from a node: the tip height, blocks with
//! full transactions, and the signing data (z, r, s, sender) of individual
//! transactions. The signing hash is rebuilt locally from the typed
//! transaction fields, picking the signer flavor (pre/post EIP-155 legacy,
//! EIP-2930, EIP-1559) the way the chain id and v value dictate.

use std::time::Duration;

use alloy_consensus::{SignableTransaction, TxEip1559, TxEip2930, TxLegacy};
use alloy_eips::eip2930::AccessList;
use alloy_primitives::{Address, Bytes, TxKind, B256, U256};
use async_trait::async_trait;
use k256::Scalar;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config;
use crate::math;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Node { code: i64, message: String },
    #[error("missing result in rpc response")]
    MissingResult,
    #[error("block {0} not found")]
    BlockNotFound(u64),
    #[error("transaction {0} not found")]
    TxNotFound(String),
    #[error("malformed transaction field: {0}")]
    Malformed(String),
    #[error("unsupported transaction type 0x{0:x}")]
    UnsupportedTxType(u64),
    #[error("unknown chain id {0}")]
    UnknownChain(u64),
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Transport(err.to_string())
    }
}

/// Transaction object as returned by `eth_getBlockByNumber(.., true)` and
/// `eth_getTransactionByHash`; only the fields the monitor consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub r: Option<String>,
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub v: Option<String>,
    #[serde(default, rename = "type")]
    pub tx_type: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub gas: Option<String>,
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default)]
    pub max_fee_per_gas: Option<String>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub chain_id: Option<String>,
    #[serde(default)]
    pub access_list: Option<AccessList>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcBlock {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

/// Everything recovery needs from one transaction.
#[derive(Debug, Clone)]
pub struct TxSigningData {
    pub from: String,
    pub z: Scalar,
    pub r: Scalar,
    pub s: Scalar,
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn latest_height(&self, chain_id: u64) -> Result<u64, RpcError>;
    async fn block_with_transactions(
        &self,
        chain_id: u64,
        height: u64,
    ) -> Result<RpcBlock, RpcError>;
    async fn tx_signing_data(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TxSigningData, RpcError>;
    async fn get_balance(&self, chain_id: u64, address: &str) -> Result<U256, RpcError>;
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

/// Live JSON-RPC client over HTTPS. One reqwest client is shared across all
/// chains; the target URL is resolved per call through the registry so the
/// provider API key is applied on every dial, reconnects included.
#[derive(Clone)]
pub struct HttpRpc {
    http: reqwest::Client,
    ankr_api_key: String,
}

impl HttpRpc {
    pub fn new(ankr_api_key: String) -> Self {
        let http = reqwest::Client::builder()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_default();
        Self { http, ankr_api_key }
    }

    async fn call(
        &self,
        chain_id: u64,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let chain = config::chain_by_id(chain_id).ok_or(RpcError::UnknownChain(chain_id))?;
        let url = chain.dial_url(&self.ankr_api_key);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;
        let body: JsonRpcResponse = response.json().await?;
        if let Some(err) = body.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }
        body.result.ok_or(RpcError::MissingResult)
    }
}

#[async_trait]
impl ChainRpc for HttpRpc {
    async fn latest_height(&self, chain_id: u64) -> Result<u64, RpcError> {
        let value = self
            .call(
                chain_id,
                "eth_blockNumber",
                serde_json::json!([]),
                Duration::from_secs(10),
            )
            .await?;
        let raw = value
            .as_str()
            .ok_or_else(|| RpcError::Malformed("eth_blockNumber result".into()))?;
        parse_quantity_u64(raw)
    }

    async fn block_with_transactions(
        &self,
        chain_id: u64,
        height: u64,
    ) -> Result<RpcBlock, RpcError> {
        let value = self
            .call(
                chain_id,
                "eth_getBlockByNumber",
                serde_json::json!([format!("0x{height:x}"), true]),
                Duration::from_secs(30),
            )
            .await?;
        if value.is_null() {
            return Err(RpcError::BlockNotFound(height));
        }
        serde_json::from_value(value).map_err(|e| RpcError::Malformed(e.to_string()))
    }

    async fn tx_signing_data(
        &self,
        chain_id: u64,
        tx_hash: &str,
    ) -> Result<TxSigningData, RpcError> {
        let value = self
            .call(
                chain_id,
                "eth_getTransactionByHash",
                serde_json::json!([tx_hash]),
                Duration::from_secs(10),
            )
            .await?;
        if value.is_null() {
            return Err(RpcError::TxNotFound(tx_hash.to_string()));
        }
        let tx: RpcTransaction =
            serde_json::from_value(value).map_err(|e| RpcError::Malformed(e.to_string()))?;
        signing_data(&tx)
    }

    async fn get_balance(&self, chain_id: u64, address: &str) -> Result<U256, RpcError> {
        let value = self
            .call(
                chain_id,
                "eth_getBalance",
                serde_json::json!([address, "latest"]),
                Duration::from_secs(10),
            )
            .await?;
        let raw = value
            .as_str()
            .ok_or_else(|| RpcError::Malformed("eth_getBalance result".into()))?;
        u256_field(Some(raw))
    }
}

/// Extract `(from, z, r, s)` from a raw RPC transaction, rebuilding the
/// signing hash for the transaction's signer flavor.
pub fn signing_data(tx: &RpcTransaction) -> Result<TxSigningData, RpcError> {
    let from = tx
        .from
        .as_deref()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| RpcError::Malformed("from".into()))?
        .to_lowercase();
    let r = scalar_field(tx.r.as_deref(), "r")?;
    let s = scalar_field(tx.s.as_deref(), "s")?;
    let hash = signing_hash(tx)?;
    Ok(TxSigningData {
        from,
        z: math::scalar_reduce_bytes(&hash.0),
        r,
        s,
    })
}

/// Signing hash of the transaction under the signer its fields select.
pub fn signing_hash(tx: &RpcTransaction) -> Result<B256, RpcError> {
    let tx_type = match tx.tx_type.as_deref() {
        None => 0,
        Some(raw) => parse_quantity_u64(raw)?,
    };
    let nonce = quantity_field(tx.nonce.as_deref(), "nonce")?;
    let gas_limit = quantity_field(tx.gas.as_deref(), "gas")?;
    let value = u256_field(tx.value.as_deref())?;
    let input = bytes_field(tx.input.as_deref())?;
    let to = tx_kind(tx.to.as_deref())?;

    match tx_type {
        0 => {
            // Legacy: v encodes whether EIP-155 replay protection applies.
            let v = quantity_field(tx.v.as_deref(), "v")?;
            let chain_id = if v >= 35 { Some((v - 35) / 2) } else { None };
            let gas_price = quantity_field(tx.gas_price.as_deref(), "gasPrice")? as u128;
            let legacy = TxLegacy {
                chain_id,
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                input,
            };
            Ok(legacy.signature_hash())
        }
        1 => {
            let chain_id = quantity_field(tx.chain_id.as_deref(), "chainId")?;
            let gas_price = quantity_field(tx.gas_price.as_deref(), "gasPrice")? as u128;
            let tx2930 = TxEip2930 {
                chain_id,
                nonce,
                gas_price,
                gas_limit,
                to,
                value,
                access_list: tx.access_list.clone().unwrap_or_default(),
                input,
            };
            Ok(tx2930.signature_hash())
        }
        2 => {
            let chain_id = quantity_field(tx.chain_id.as_deref(), "chainId")?;
            let max_fee = quantity_field(tx.max_fee_per_gas.as_deref(), "maxFeePerGas")? as u128;
            let max_priority =
                quantity_field(tx.max_priority_fee_per_gas.as_deref(), "maxPriorityFeePerGas")?
                    as u128;
            let tx1559 = TxEip1559 {
                chain_id,
                nonce,
                gas_limit,
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: max_priority,
                to,
                value,
                access_list: tx.access_list.clone().unwrap_or_default(),
                input,
            };
            Ok(tx1559.signature_hash())
        }
        other => Err(RpcError::UnsupportedTxType(other)),
    }
}

pub fn parse_quantity_u64(raw: &str) -> Result<u64, RpcError> {
    let stripped = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if stripped.is_empty() {
        return Err(RpcError::Malformed(format!("empty quantity {raw:?}")));
    }
    u64::from_str_radix(stripped, 16).map_err(|_| RpcError::Malformed(raw.to_string()))
}

fn quantity_field(raw: Option<&str>, name: &str) -> Result<u64, RpcError> {
    let raw = raw.ok_or_else(|| RpcError::Malformed(name.to_string()))?;
    parse_quantity_u64(raw)
}

fn u256_field(raw: Option<&str>) -> Result<U256, RpcError> {
    match raw {
        None => Ok(U256::ZERO),
        Some(raw) => {
            let stripped = raw.strip_prefix("0x").unwrap_or(raw);
            if stripped.is_empty() {
                return Ok(U256::ZERO);
            }
            U256::from_str_radix(stripped, 16).map_err(|_| RpcError::Malformed(raw.to_string()))
        }
    }
}

fn bytes_field(raw: Option<&str>) -> Result<Bytes, RpcError> {
    match raw {
        None => Ok(Bytes::new()),
        Some(raw) => {
            let stripped = raw.strip_prefix("0x").unwrap_or(raw);
            let decoded =
                hex::decode(stripped).map_err(|_| RpcError::Malformed(raw.to_string()))?;
            Ok(Bytes::from(decoded))
        }
    }
}

fn tx_kind(to: Option<&str>) -> Result<TxKind, RpcError> {
    match to {
        None => Ok(TxKind::Create),
        Some(raw) if raw.is_empty() => Ok(TxKind::Create),
        Some(raw) => {
            let addr: Address = raw
                .parse()
                .map_err(|_| RpcError::Malformed(format!("to address {raw:?}")))?;
            Ok(TxKind::Call(addr))
        }
    }
}

fn scalar_field(raw: Option<&str>, name: &str) -> Result<Scalar, RpcError> {
    let raw = raw.ok_or_else(|| RpcError::Malformed(name.to_string()))?;
    math::scalar_from_hex(raw).map_err(|e| RpcError::Malformed(format!("{name}: {e}")))
}
