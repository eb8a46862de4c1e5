//! Block import through a black-box state transition tool (`evm t8n`).
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use alloy_rlp::Encodable;
use async_trait::async_trait;
use ef_fixtures::{Alloc, BlockException, DecodedBlock, ExceptionTag, Fork, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::engine::BlockOutcome;
use crate::models::error::RunnerError;
use crate::traits::{BlockTarget, GenesisInfo};

const ETHER: u128 = 1_000_000_000_000_000_000;
/// Depth of the `BLOCKHASH` window.
const BLOCK_HASH_WINDOW: u64 = 256;

/// The stdin document of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionInput {
    pub alloc: Alloc,
    pub env: Value,
    pub txs_rlp: Bytes,
}

/// Per-call parameters passed as flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOptions {
    pub fork: Fork,
    pub chain_id: U256,
    /// Mining reward; `None` disables rewards.
    pub reward: Option<U256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RejectedTx {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub state_root: B256,
    #[serde(default)]
    pub tx_root: B256,
    #[serde(default)]
    pub receipts_root: B256,
    #[serde(default)]
    pub gas_used: U64,
    #[serde(default)]
    pub rejected: Vec<RejectedTx>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TransitionOutput {
    pub alloc: Alloc,
    pub result: ExecutionResult,
}

/// A state transition function: pre-state, environment and transactions in,
/// post-state and execution summary out.
#[async_trait]
pub trait TransitionTool: Send + Sync {
    async fn transition(
        &self,
        input: &TransitionInput,
        options: TransitionOptions,
    ) -> Result<TransitionOutput, RunnerError>;

    /// Computes the state root of `alloc` by running an empty Frontier block
    /// without rewards, so that no account is touched.
    async fn compute_state_root(&self, alloc: &Alloc, chain_id: U256) -> Result<B256, RunnerError> {
        let input = TransitionInput {
            alloc: alloc.clone(),
            env: json!({
                "currentCoinbase": Address::ZERO,
                "currentGasLimit": U256::from(5000),
                "currentNumber": U256::ZERO,
                "currentTimestamp": U256::ZERO,
                "currentDifficulty": U256::from(0x20000),
            }),
            txs_rlp: encode_transactions(&[]),
        };
        let options = TransitionOptions {
            fork: Fork::Frontier,
            chain_id,
            reward: None,
        };
        Ok(self.transition(&input, options).await?.result.state_root)
    }
}

/// Runs a geth-style `evm t8n` process per transition.
#[derive(Debug, Clone)]
pub struct CommandTransitionTool {
    binary: PathBuf,
    subcommand: Vec<String>,
}

impl CommandTransitionTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            subcommand: vec!["t8n".to_string()],
        }
    }

    /// Replaces the arguments placed before the transition flags.
    #[must_use]
    pub fn with_subcommand(mut self, subcommand: Vec<String>) -> Self {
        self.subcommand = subcommand;
        self
    }

    fn args(&self, options: TransitionOptions) -> Vec<String> {
        let reward = options
            .reward
            .map_or_else(|| "-1".to_string(), |reward| reward.to_string());
        let mut args = self.subcommand.clone();
        args.extend([
            "--input.alloc=stdin".to_string(),
            "--input.env=stdin".to_string(),
            "--input.txs=stdin".to_string(),
            "--output.result=stdout".to_string(),
            "--output.alloc=stdout".to_string(),
            format!("--state.fork={}", t8n_fork_name(options.fork)),
            format!("--state.chainid={}", options.chain_id),
            format!("--state.reward={reward}"),
        ]);
        args
    }
}

#[async_trait]
impl TransitionTool for CommandTransitionTool {
    async fn transition(
        &self,
        input: &TransitionInput,
        options: TransitionOptions,
    ) -> Result<TransitionOutput, RunnerError> {
        let io_error = |error: std::io::Error| RunnerError::Io {
            path: self.binary.clone(),
            error: error.to_string(),
        };
        let mut child = Command::new(&self.binary)
            .args(self.args(options))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(io_error)?;

        let stdin_doc = serde_json::to_vec(input)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_doc).await.map_err(io_error)?;
        }
        let output = child.wait_with_output().await.map_err(io_error)?;
        if !output.status.success() {
            return Err(RunnerError::ToolFailure {
                tool: self.binary.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

/// Fork names as the transition tool spells them.
fn t8n_fork_name(fork: Fork) -> String {
    match fork {
        Fork::Paris => "Merge".to_string(),
        other => other.to_string(),
    }
}

/// Encodes transactions as the RLP list the tool expects: legacy
/// transactions as nested lists, typed ones wrapped in a string.
fn encode_transactions(transactions: &[Bytes]) -> Bytes {
    let mut items = Vec::new();
    for tx in transactions {
        if tx.first().is_some_and(|&b| b >= 0xc0) {
            items.extend_from_slice(tx);
        } else {
            tx.encode(&mut items);
        }
    }
    let mut out = Vec::with_capacity(items.len() + 9);
    alloy_rlp::Header {
        list: true,
        payload_length: items.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&items);
    out.into()
}

fn block_reward(fork: Fork) -> Option<U256> {
    let ether = if fork < Fork::Byzantium {
        5
    } else if fork < Fork::Constantinople {
        3
    } else if fork < Fork::Paris {
        2
    } else {
        return None;
    };
    Some(U256::from(ether * ETHER))
}

#[derive(Debug, Clone)]
struct StoredBlock {
    header: Header,
    alloc: Alloc,
}

/// A [`BlockTarget`] keeping every imported state in memory and executing
/// blocks with a [`TransitionTool`].
pub struct TransitionTarget<T> {
    tool: T,
    chain_id: U256,
    fork: Fork,
    blocks: HashMap<B256, StoredBlock>,
    head: B256,
}

impl<T: TransitionTool> TransitionTarget<T> {
    pub fn new(tool: T, chain_id: U256) -> Self {
        Self {
            tool,
            chain_id,
            fork: Fork::Frontier,
            blocks: HashMap::new(),
            head: B256::ZERO,
        }
    }

    /// Hashes of up to 256 ancestors, starting at `parent`.
    fn ancestor_hashes(&self, parent: B256) -> BTreeMap<String, B256> {
        let mut hashes = BTreeMap::new();
        let mut cursor = parent;
        while let Some(block) = self.blocks.get(&cursor) {
            hashes.insert(block.header.number.to_string(), cursor);
            if hashes.len() as u64 >= BLOCK_HASH_WINDOW || block.header.number.is_zero() {
                break;
            }
            cursor = block.header.parent_hash;
        }
        hashes
    }

    fn environment(&self, block: &DecodedBlock, fork: Fork) -> Value {
        let header = &block.header;
        let ommers: Vec<Value> = block
            .uncles
            .iter()
            .map(|uncle| {
                json!({
                    "delta": header.number_u64().saturating_sub(uncle.number_u64()),
                    "address": uncle.coinbase,
                })
            })
            .collect();
        let mut env = json!({
            "currentCoinbase": header.coinbase,
            "currentGasLimit": header.gas_limit,
            "currentNumber": header.number,
            "currentTimestamp": header.timestamp,
            "currentDifficulty": header.difficulty,
            "currentBaseFee": header.base_fee_per_gas,
            "currentExcessBlobGas": header.excess_blob_gas,
            "parentBeaconBlockRoot": header.parent_beacon_block_root,
            "blockHashes": self.ancestor_hashes(header.parent_hash),
            "ommers": ommers,
            "withdrawals": block.withdrawals,
        });
        if fork.is_post_merge() {
            env["currentRandom"] = json!(header.mix_hash);
        }
        if let Some(parent) = self.blocks.get(&header.parent_hash) {
            env["parentTimestamp"] = json!(parent.header.timestamp);
            env["parentDifficulty"] = json!(parent.header.difficulty);
            env["parentUncleHash"] = json!(parent.header.uncle_hash);
        }
        if let Value::Object(fields) = &mut env {
            fields.retain(|_, value| !value.is_null());
        }
        env
    }
}

fn rejected(message: String) -> BlockOutcome {
    BlockOutcome::Rejected { message, tag: None }
}

#[async_trait]
impl<T: TransitionTool> BlockTarget for TransitionTarget<T> {
    async fn init_genesis(
        &mut self,
        fork: Fork,
        pre: &Alloc,
        genesis: &Header,
    ) -> Result<GenesisInfo, RunnerError> {
        let state_root = self.tool.compute_state_root(pre, self.chain_id).await?;
        let hash = genesis.hash_slow();
        self.fork = fork;
        self.blocks.clear();
        self.blocks.insert(
            hash,
            StoredBlock {
                header: genesis.clone(),
                alloc: pre.clone(),
            },
        );
        self.head = hash;
        Ok(GenesisInfo { state_root, hash })
    }

    async fn apply_block(
        &mut self,
        block: &DecodedBlock,
        _raw: &Bytes,
    ) -> Result<BlockOutcome, RunnerError> {
        let header = &block.header;
        let Some(parent) = self.blocks.get(&header.parent_hash) else {
            return Ok(BlockOutcome::Rejected {
                message: format!("unknown ancestor {}", header.parent_hash),
                tag: Some(ExceptionTag::Block(BlockException::UnknownParent)),
            });
        };
        if header.number != parent.header.number + U256::from(1) {
            return Ok(rejected(format!(
                "invalid block number: parent {} child {}",
                parent.header.number, header.number
            )));
        }
        if header.timestamp <= parent.header.timestamp {
            return Ok(rejected(format!(
                "timestamp older than parent: parent {} child {}",
                parent.header.timestamp, header.timestamp
            )));
        }

        let fork = self.fork.at(header.timestamp.saturating_to());
        let input = TransitionInput {
            alloc: parent.alloc.clone(),
            env: self.environment(block, fork),
            txs_rlp: encode_transactions(&block.transactions),
        };
        let options = TransitionOptions {
            fork,
            chain_id: self.chain_id,
            reward: block_reward(fork),
        };
        trace!("t8n block #{} {}", block.number(), block.hash);
        let output = match self.tool.transition(&input, options).await {
            Ok(output) => output,
            Err(RunnerError::ToolFailure { stderr, .. }) => return Ok(rejected(stderr)),
            Err(err) => return Err(err),
        };

        let result = &output.result;
        if let Some(tx) = result.rejected.first() {
            debug!("transaction {} rejected: {}", tx.index, tx.error);
            return Ok(rejected(tx.error.clone()));
        }
        if result.gas_used.to::<u64>() != header.gas_used.saturating_to::<u64>() {
            return Ok(rejected(format!(
                "invalid gas used (remote: {} local: {})",
                header.gas_used, result.gas_used
            )));
        }
        if result.receipts_root != header.receipt_trie {
            return Ok(rejected(format!(
                "invalid receipt root hash (remote: {} local: {})",
                header.receipt_trie, result.receipts_root
            )));
        }
        if result.state_root != header.state_root {
            return Ok(rejected(format!(
                "invalid merkle root (remote: {} local: {})",
                header.state_root, result.state_root
            )));
        }

        self.blocks.insert(
            block.hash,
            StoredBlock {
                header: header.clone(),
                alloc: output.alloc,
            },
        );
        self.head = block.hash;
        Ok(BlockOutcome::Accepted {
            hash: block.hash,
            number: block.number(),
            state_root: header.state_root,
        })
    }

    async fn state_alloc(&mut self, _hint: &Alloc) -> Result<Alloc, RunnerError> {
        self.blocks
            .get(&self.head)
            .map(|block| block.alloc.clone())
            .ok_or_else(|| RunnerError::Other("no state imported yet".into()))
    }

    async fn reset_to(&mut self, hash: B256) -> Result<(), RunnerError> {
        if !self.blocks.contains_key(&hash) {
            return Err(RunnerError::Other(format!("unknown block {hash}")));
        }
        self.head = hash;
        Ok(())
    }
}
