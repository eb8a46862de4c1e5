use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use ef_fixtures::{Account, EngineNewPayload};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::trace;

use super::jwt::JwtSecret;
use crate::models::error::RunnerError;
use crate::traits::EngineTarget;

/// Status reported by `engine_newPayload` and `engine_forkchoiceUpdated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadStatusKind {
    Valid,
    Invalid,
    Syncing,
    Accepted,
    InvalidBlockHash,
}

impl PayloadStatusKind {
    /// Whether the client has not reached a decision yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Syncing | Self::Accepted)
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid | Self::InvalidBlockHash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadStatus {
    pub status: PayloadStatusKind,
    #[serde(default)]
    pub latest_valid_hash: Option<B256>,
    #[serde(default)]
    pub validation_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkchoiceState {
    pub head_block_hash: B256,
    pub safe_block_hash: B256,
    pub finalized_block_hash: B256,
}

impl ForkchoiceState {
    /// Head at `hash`, safe and finalized left unset.
    pub fn head(hash: B256) -> Self {
        Self {
            head_block_hash: hash,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForkchoiceUpdatedResponse {
    payload_status: PayloadStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Number(u64),
}

impl BlockTag {
    fn to_param(self) -> Value {
        match self {
            Self::Latest => json!("latest"),
            Self::Number(n) => json!(format!("{n:#x}")),
        }
    }
}

/// The fields of a block the consumer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub hash: B256,
    #[serde(deserialize_with = "deserialize_quantity")]
    pub number: u64,
    pub state_root: B256,
}

fn deserialize_quantity<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(U64::deserialize(deserializer)?.to::<u64>())
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

/// JSON-RPC 2.0 client for a single execution client endpoint.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    url: String,
    jwt: Option<JwtSecret>,
    next_id: AtomicU64,
}

impl RpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            jwt: None,
            next_id: AtomicU64::new(1),
        })
    }

    /// Authenticates every request with a freshly signed token.
    #[must_use]
    pub fn with_jwt(mut self, secret: JwtSecret) -> Self {
        self.jwt = Some(secret);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Calls `method`. A JSON-RPC error object is returned as
    /// [`RunnerError::Rpc`]; a `null` result only deserializes into an
    /// `Option`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, RunnerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        trace!("rpc request {id} {method}");

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(jwt) = &self.jwt {
            request = request.bearer_auth(jwt.token()?);
        }
        let response: RpcResponse = request.send().await?.error_for_status()?.json().await?;

        if let Some(error) = response.error {
            return Err(RunnerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        serde_json::from_value(response.result).map_err(|err| {
            RunnerError::Transport(format!("unexpected {method} result: {err}"))
        })
    }
}

#[async_trait]
impl EngineTarget for RpcClient {
    async fn new_payload(
        &mut self,
        version: u8,
        payload: &EngineNewPayload,
    ) -> Result<PayloadStatus, RunnerError> {
        self.call(&format!("engine_newPayloadV{version}"), payload.params())
            .await
    }

    async fn forkchoice_updated(
        &mut self,
        version: u8,
        state: ForkchoiceState,
    ) -> Result<PayloadStatus, RunnerError> {
        let response: ForkchoiceUpdatedResponse = self
            .call(
                &format!("engine_forkchoiceUpdatedV{version}"),
                vec![json!(state), Value::Null],
            )
            .await?;
        Ok(response.payload_status)
    }

    async fn block(&mut self, tag: BlockTag) -> Result<Option<BlockSummary>, RunnerError> {
        self.call("eth_getBlockByNumber", vec![tag.to_param(), json!(false)])
            .await
    }

    async fn account(
        &mut self,
        address: Address,
        keys: &[U256],
    ) -> Result<Option<Account>, RunnerError> {
        let latest = || json!("latest");
        let balance: U256 = self
            .call("eth_getBalance", vec![json!(address), latest()])
            .await?;
        let nonce: U256 = self
            .call("eth_getTransactionCount", vec![json!(address), latest()])
            .await?;
        let code: Bytes = self
            .call("eth_getCode", vec![json!(address), latest()])
            .await?;
        let mut account = Account {
            balance,
            nonce,
            code,
            ..Default::default()
        };
        for key in keys {
            let value: B256 = self
                .call(
                    "eth_getStorageAt",
                    vec![json!(address), json!(B256::from(key.to_be_bytes::<32>())), latest()],
                )
                .await?;
            account.storage.insert(*key, U256::from_be_bytes(value.0));
        }
        if account.is_empty() {
            return Ok(None);
        }
        Ok(Some(account))
    }
}
