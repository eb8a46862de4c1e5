//! Seams between the consumption engines and the systems under test.
//! Inspired by <https://github.com/paradigmxyz/reth/tree/main/testing/ef-tests>
use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use ef_fixtures::{Account, Alloc, ChainHead, DecodedBlock, EngineNewPayload, Fork, Header};

use crate::engine::BlockOutcome;
use crate::models::error::RunnerError;
use crate::targets::rpc::{BlockSummary, BlockTag, ForkchoiceState, PayloadStatus};

/// Root and hash of the genesis block a target was initialized with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenesisInfo {
    pub state_root: B256,
    pub hash: B256,
}

/// A target fed with whole blocks.
#[async_trait]
pub trait BlockTarget: Send {
    /// Loads the pre-state and the genesis block.
    async fn init_genesis(
        &mut self,
        fork: Fork,
        pre: &Alloc,
        genesis: &Header,
    ) -> Result<GenesisInfo, RunnerError>;

    /// Imports one decoded block. Only `Accepted` and `Rejected` are expected
    /// back; the engine produces the other outcomes itself.
    async fn apply_block(
        &mut self,
        block: &DecodedBlock,
        raw: &Bytes,
    ) -> Result<BlockOutcome, RunnerError>;

    /// Returns the state at the current head. `hint` lists the accounts and
    /// slots of interest, targets that can enumerate their state may ignore it.
    async fn state_alloc(&mut self, hint: &Alloc) -> Result<Alloc, RunnerError>;

    /// Moves the head back to an already imported block.
    async fn reset_to(&mut self, hash: B256) -> Result<(), RunnerError>;
}

/// A client driven through the Engine API.
#[async_trait]
pub trait EngineTarget: Send {
    async fn new_payload(
        &mut self,
        version: u8,
        payload: &EngineNewPayload,
    ) -> Result<PayloadStatus, RunnerError>;

    async fn forkchoice_updated(
        &mut self,
        version: u8,
        state: ForkchoiceState,
    ) -> Result<PayloadStatus, RunnerError>;

    async fn block(&mut self, tag: BlockTag) -> Result<Option<BlockSummary>, RunnerError>;

    /// Returns the account at the latest block, `None` when it does not exist.
    /// Only the storage slots in `keys` are read.
    async fn account(
        &mut self,
        address: Address,
        keys: &[U256],
    ) -> Result<Option<Account>, RunnerError>;

    async fn block_hash(&mut self, number: u64) -> Result<Option<B256>, RunnerError> {
        Ok(self.block(BlockTag::Number(number)).await?.map(|b| b.hash))
    }

    async fn head(&mut self) -> Result<ChainHead, RunnerError> {
        self.block(BlockTag::Latest)
            .await?
            .map(|b| ChainHead {
                hash: b.hash,
                number: b.number,
            })
            .ok_or_else(|| RunnerError::Other("client has no latest block".into()))
    }
}

/// Accounts and slots to read back after a fixture: everything in `pre` or
/// `expected`, with the storage keys of both. Accounts that were deleted and
/// slots that were cleared are read too.
pub fn state_hint(pre: &Alloc, expected: &Alloc) -> Alloc {
    let mut hint = pre.clone();
    for (address, account) in expected {
        let entry = hint.entry(*address).or_default();
        entry
            .storage
            .extend(account.storage.iter().map(|(key, value)| (*key, *value)));
    }
    hint
}

/// Reads the accounts named by `hint` from an Engine-API client.
pub async fn read_state<T: EngineTarget>(
    target: &mut T,
    hint: &Alloc,
) -> Result<Alloc, RunnerError> {
    let mut alloc = Alloc::new();
    for (address, expected) in hint {
        let keys: Vec<U256> = expected.storage.keys().copied().collect();
        if let Some(account) = target.account(*address, &keys).await? {
            alloc.insert(*address, account);
        }
    }
    Ok(alloc)
}

/// What a launcher needs to bring up a client for a group of fixtures.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub client_id: String,
    pub fork: Fork,
    pub genesis: Header,
    pub pre: Arc<Alloc>,
    pub chain_id: U256,
    /// Label used by the orchestration service for the client's test.
    pub label: String,
}

/// Starts and stops client instances.
#[async_trait]
pub trait ClientLauncher: Send + Sync {
    type Client: EngineTarget;

    async fn start(&self, spec: &ClientSpec) -> Result<Self::Client, RunnerError>;

    async fn stop(&self, client: Self::Client) -> Result<(), RunnerError>;
}
