use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use alloy_primitives::{hex, keccak256, Address, Bytes, B256, U256, U64};
use alloy_rlp::Encodable;
use serde_json::json;
use async_trait::async_trait;
use ef_fixtures::{
    Account, Alloc, BlockchainFixture, ChainHead, DecodedBlock, EngineNewPayload, ExceptionTag,
    ExecutionPayload, FixtureBlock, Fork, Header,
};
use tracing_subscriber::{filter, FmtSubscriber};

use crate::engine::BlockOutcome;
use crate::models::error::RunnerError;
use crate::targets::rpc::{BlockSummary, BlockTag, ForkchoiceState, PayloadStatus, PayloadStatusKind};
use crate::traits::{BlockTarget, ClientLauncher, ClientSpec, EngineTarget, GenesisInfo};

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        // Set-up tracing filter
        let filter = filter::EnvFilter::new("ef_consume=info,ef_fixtures=info");
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .without_time()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting tracing default failed");
    })
}

pub struct TestMonitor {
    /// thresholds in seconds
    thresholds: Vec<u64>,
}

impl TestMonitor {
    pub const fn new(thresholds: Vec<u64>) -> Self {
        Self { thresholds }
    }

    pub fn run<F, T>(&mut self, test_name: &str, test_fn: F) -> T
    where
        F: FnOnce() -> T,
    {
        let start_time = Instant::now();
        let is_running = Arc::new(AtomicBool::new(true));
        let is_running_clone = is_running.clone();

        let test_name = test_name.to_string();
        let thresholds = self.thresholds.clone();
        let watched_name = test_name.clone();
        let monitor_thread = thread::spawn(move || {
            while is_running_clone.load(Ordering::SeqCst) {
                let duration = start_time.elapsed().as_secs();
                if let Some(threshold) = thresholds.iter().rev().find(|&&t| duration > t) {
                    tracing::warn!(
                        "fixture '{watched_name}' has been running for over {threshold} seconds"
                    );
                    thread::sleep(Duration::from_secs(std::cmp::min(threshold / 2, 30)));
                }
                thread::sleep(Duration::from_secs(1));
            }
        });

        let result = test_fn();

        is_running.store(false, Ordering::SeqCst);
        let _ = monitor_thread.join();

        let final_duration = start_time.elapsed().as_secs();
        if self.thresholds.first().is_some_and(|&t| final_duration > t) {
            tracing::info!("fixture '{test_name}' completed in {final_duration} seconds");
        }

        result
    }
}

// Helper macro to make it easier to use
#[macro_export]
macro_rules! monitor_test {
    ($name:expr, $thresholds:expr, $test:expr) => {{
        let mut monitor = $crate::test_utils::TestMonitor::new($thresholds.to_vec());
        monitor.run($name, $test)
    }};
}

/// State root every fake target reports.
pub const STATE_ROOT: B256 = B256::new([0x11; 32]);

const EMPTY_LIST: u8 = 0xc0;

pub fn pre_alloc() -> Alloc {
    let sender = Account {
        balance: U256::from(1_000_000_000_000_000_000u64),
        ..Default::default()
    };
    let mut contract = Account {
        balance: U256::from(1),
        nonce: U256::from(1),
        code: Bytes::from_static(&[0x60, 0x00, 0x60, 0x00, 0x55, 0x00]),
        ..Default::default()
    };
    contract.storage.insert(U256::from(1), U256::from(0xff));
    [
        (Address::repeat_byte(0xa9), sender),
        (Address::repeat_byte(0xcc), contract),
    ]
    .into_iter()
    .collect()
}

pub fn genesis_header() -> Header {
    Header {
        coinbase: Address::repeat_byte(0x2a),
        state_root: STATE_ROOT,
        gas_limit: U256::from(30_000_000),
        base_fee_per_gas: Some(U256::from(7)),
        withdrawals_root: Some(B256::ZERO),
        blob_gas_used: Some(U256::ZERO),
        excess_blob_gas: Some(U256::ZERO),
        parent_beacon_block_root: Some(B256::ZERO),
        ..Default::default()
    }
}

fn base_fixture(pre: Alloc) -> BlockchainFixture {
    let genesis = genesis_header();
    BlockchainFixture {
        network: Fork::Cancun,
        lastblockhash: genesis.hash_slow(),
        genesis_block_header: genesis,
        genesis_rlp: None,
        pre: Some(pre.clone()),
        pre_hash: None,
        blocks: Vec::new(),
        engine_new_payloads: Vec::new(),
        engine_fcu_version: None,
        post_state: Some(pre),
        post_state_hash: None,
        post_state_diff: None,
        config: None,
        seal_engine: None,
        info: None,
    }
}

/// Encodes `[header, [], [], []]`.
fn encode_block(header: &Header) -> String {
    let mut body = Vec::new();
    header.encode(&mut body);
    body.extend_from_slice(&[EMPTY_LIST, EMPTY_LIST, EMPTY_LIST]);
    let mut out = Vec::new();
    alloy_rlp::Header {
        list: true,
        payload_length: body.len(),
    }
    .encode(&mut out);
    out.extend_from_slice(&body);
    hex::encode_prefixed(out)
}

/// A direct fixture with `count` empty blocks. When `exception` is set the
/// last block exceeds its gas limit and is expected to be rejected with it.
pub fn fixture(count: usize, exception: Option<&str>) -> BlockchainFixture {
    let mut fixture = base_fixture(pre_alloc());
    let mut parent = fixture.genesis_block_header.clone();
    let mut parent_hash = parent.hash_slow();
    for index in 0..count {
        let invalid = exception.is_some() && index + 1 == count;
        let mut header = Header {
            parent_hash,
            number: parent.number + U256::from(1),
            timestamp: parent.timestamp + U256::from(12),
            ..parent.clone()
        };
        if invalid {
            header.gas_used = header.gas_limit + U256::from(1);
        }
        let hash = header.hash_slow();
        let rlp = encode_block(&header);
        header.hash = Some(hash);
        fixture.blocks.push(FixtureBlock {
            rlp,
            block_header: Some(header.clone()),
            transactions: None,
            uncle_headers: None,
            withdrawals: None,
            expect_exception: exception
                .filter(|_| invalid)
                .map(|e| e.parse().expect("valid exception set")),
            rlp_decoded: None,
        });
        if !invalid {
            parent = Header { hash: None, ..header };
            parent_hash = hash;
        }
    }
    fixture.lastblockhash = parent_hash;
    fixture
}

/// An Engine-API fixture with `count` Cancun payloads. `invalid` marks one
/// payload as expected to fail with the given exception; later payloads build
/// on the last valid one.
pub fn engine_fixture(count: usize, invalid: Option<(usize, &str)>) -> BlockchainFixture {
    let mut fixture = base_fixture(pre_alloc());
    let mut parent_hash = fixture.genesis_hash();
    let mut parent_number = 0u64;
    for index in 0..count {
        let block_hash = keccak256((index as u64).to_be_bytes());
        let validation_error = invalid
            .filter(|(i, _)| *i == index)
            .map(|(_, e)| e.parse().expect("valid exception set"));
        let execution_payload = ExecutionPayload {
            parent_hash,
            fee_recipient: Address::repeat_byte(0x2a),
            state_root: STATE_ROOT,
            block_number: U64::from(parent_number + 1),
            gas_limit: U64::from(30_000_000),
            timestamp: U64::from(12 * (parent_number + 1)),
            base_fee_per_gas: U256::from(7),
            block_hash,
            withdrawals: Some(Vec::new()),
            blob_gas_used: Some(U64::ZERO),
            excess_blob_gas: Some(U64::ZERO),
            ..Default::default()
        };
        if validation_error.is_none() {
            parent_hash = block_hash;
            parent_number += 1;
        }
        fixture.engine_new_payloads.push(EngineNewPayload {
            execution_payload,
            version: 3,
            blob_versioned_hashes: Some(Vec::new()),
            parent_beacon_block_root: Some(B256::ZERO),
            execution_requests: None,
            validation_error,
            error_code: None,
            forkchoice_updated_version: None,
        });
    }
    fixture.lastblockhash = parent_hash;
    fixture
}

/// JSON form of a direct fixture built by [`fixture`], as found in fixture
/// files.
pub fn fixture_json(fixture: &BlockchainFixture) -> serde_json::Value {
    let blocks: Vec<serde_json::Value> = fixture
        .blocks
        .iter()
        .map(|block| {
            let mut value = json!({ "rlp": block.rlp, "blockHeader": block.block_header });
            if let Some(exception) = &block.expect_exception {
                value["expectException"] = json!(exception.to_string());
            }
            value
        })
        .collect();
    json!({
        "network": fixture.network.to_string(),
        "genesisBlockHeader": fixture.genesis_block_header,
        "pre": fixture.pre,
        "blocks": blocks,
        "lastblockhash": fixture.lastblockhash,
        "postState": fixture.post_state,
    })
}

/// Applies the accounts of `changes` on top of `alloc`.
fn apply_changes(alloc: &Alloc, changes: Option<&Alloc>) -> Alloc {
    let mut alloc = alloc.clone();
    if let Some(changes) = changes {
        alloc.extend(changes.iter().map(|(address, account)| (*address, account.clone())));
    }
    alloc
}

/// In-memory [`BlockTarget`] that accepts every block extending a known
/// parent. Each block applies its entry in `changes`, keyed by block hash.
#[derive(Debug, Default)]
pub struct FakeBlockTarget {
    pub applied: usize,
    pub inits: usize,
    pub delay: Option<Duration>,
    /// When set, blocks using more gas than their limit are rejected with
    /// this message and tag.
    pub rejection: Option<(String, Option<ExceptionTag>)>,
    /// When set, every block import fails with this error.
    pub fault: Option<String>,
    pub changes: HashMap<B256, Alloc>,
    known: HashMap<B256, Alloc>,
    head: B256,
}

impl FakeBlockTarget {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    pub fn with_changes(changes: HashMap<B256, Alloc>) -> Self {
        Self {
            changes,
            ..Default::default()
        }
    }

    pub fn faulting(message: &str) -> Self {
        Self {
            fault: Some(message.to_string()),
            ..Default::default()
        }
    }

    pub fn rejecting(message: &str) -> Self {
        Self {
            rejection: Some((message.to_string(), None)),
            ..Default::default()
        }
    }

    pub fn rejecting_with_tag(tag: ExceptionTag) -> Self {
        Self {
            rejection: Some((tag.to_string(), Some(tag))),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BlockTarget for FakeBlockTarget {
    async fn init_genesis(
        &mut self,
        _fork: Fork,
        pre: &Alloc,
        genesis: &Header,
    ) -> Result<GenesisInfo, RunnerError> {
        let hash = genesis.hash_slow();
        self.inits += 1;
        self.known.clear();
        self.known.insert(hash, pre.clone());
        self.head = hash;
        Ok(GenesisInfo {
            state_root: STATE_ROOT,
            hash,
        })
    }

    async fn apply_block(
        &mut self,
        block: &DecodedBlock,
        _raw: &Bytes,
    ) -> Result<BlockOutcome, RunnerError> {
        self.applied += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(fault) = &self.fault {
            return Err(RunnerError::Other(fault.clone()));
        }
        let Some(parent) = self.known.get(&block.parent_hash()) else {
            return Ok(BlockOutcome::Rejected {
                message: "unknown ancestor".into(),
                tag: None,
            });
        };
        if let Some((message, tag)) = &self.rejection {
            if block.header.gas_used > block.header.gas_limit {
                return Ok(BlockOutcome::Rejected {
                    message: message.clone(),
                    tag: *tag,
                });
            }
        }
        let alloc = apply_changes(parent, self.changes.get(&block.hash));
        self.known.insert(block.hash, alloc);
        self.head = block.hash;
        Ok(BlockOutcome::Accepted {
            hash: block.hash,
            number: block.number(),
            state_root: block.header.state_root,
        })
    }

    async fn state_alloc(&mut self, _hint: &Alloc) -> Result<Alloc, RunnerError> {
        self.known
            .get(&self.head)
            .cloned()
            .ok_or_else(|| RunnerError::Other("no genesis".into()))
    }

    async fn reset_to(&mut self, hash: B256) -> Result<(), RunnerError> {
        if !self.known.contains_key(&hash) {
            return Err(RunnerError::Other(format!("unknown block {hash}")));
        }
        self.head = hash;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredBlock {
    summary: BlockSummary,
    parent: B256,
    alloc: Alloc,
}

/// In-memory [`EngineTarget`] that accepts every payload extending a known
/// block. Each payload applies its entry in `changes`, keyed by block hash;
/// state is read at the head, so moving the head back rolls changes back.
#[derive(Debug, Default)]
pub struct FakeEngineTarget {
    pub head: ChainHead,
    /// Payloads answered with `INVALID` and the given validation error.
    pub invalid: HashMap<B256, String>,
    /// Payloads answered with a JSON-RPC error.
    pub rpc_errors: HashMap<B256, (i64, String)>,
    /// Number of `SYNCING` answers before payloads are processed.
    pub syncing_rounds: usize,
    pub new_payload_calls: usize,
    /// Answer forkchoice updates back to genesis with `INVALID`.
    pub refuse_reset: bool,
    pub resets: Arc<AtomicUsize>,
    pub changes: HashMap<B256, Alloc>,
    genesis: B256,
    blocks: HashMap<B256, StoredBlock>,
}

impl FakeEngineTarget {
    pub fn new(genesis: &Header, pre: &Alloc) -> Self {
        let hash = genesis.hash_slow();
        let summary = BlockSummary {
            hash,
            number: genesis.number_u64(),
            state_root: genesis.state_root,
        };
        Self {
            head: ChainHead {
                hash,
                number: summary.number,
            },
            genesis: hash,
            blocks: [(
                hash,
                StoredBlock {
                    summary,
                    parent: B256::ZERO,
                    alloc: pre.clone(),
                },
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    pub fn for_fixture(fixture: &BlockchainFixture) -> Self {
        Self::new(
            &fixture.genesis_block_header,
            fixture.pre.as_ref().unwrap_or(&Alloc::new()),
        )
    }

    fn status(status: PayloadStatusKind, validation_error: Option<String>) -> PayloadStatus {
        PayloadStatus {
            status,
            latest_valid_hash: None,
            validation_error,
        }
    }
}

#[async_trait]
impl EngineTarget for FakeEngineTarget {
    async fn new_payload(
        &mut self,
        _version: u8,
        payload: &EngineNewPayload,
    ) -> Result<PayloadStatus, RunnerError> {
        self.new_payload_calls += 1;
        let hash = payload.block_hash();
        if let Some((code, message)) = self.rpc_errors.get(&hash) {
            return Err(RunnerError::Rpc {
                code: *code,
                message: message.clone(),
            });
        }
        if self.syncing_rounds > 0 {
            self.syncing_rounds -= 1;
            return Ok(Self::status(PayloadStatusKind::Syncing, None));
        }
        if let Some(message) = self.invalid.get(&hash) {
            return Ok(Self::status(PayloadStatusKind::Invalid, Some(message.clone())));
        }
        let parent = payload.execution_payload.parent_hash;
        let Some(parent_block) = self.blocks.get(&parent) else {
            return Ok(Self::status(PayloadStatusKind::Syncing, None));
        };
        let alloc = apply_changes(&parent_block.alloc, self.changes.get(&hash));
        let summary = BlockSummary {
            hash,
            number: payload.execution_payload.number(),
            state_root: payload.execution_payload.state_root,
        };
        self.blocks.insert(
            hash,
            StoredBlock {
                summary,
                parent,
                alloc,
            },
        );
        Ok(Self::status(PayloadStatusKind::Valid, None))
    }

    async fn forkchoice_updated(
        &mut self,
        _version: u8,
        state: ForkchoiceState,
    ) -> Result<PayloadStatus, RunnerError> {
        let hash = state.head_block_hash;
        if hash == self.genesis {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.refuse_reset {
                return Ok(Self::status(PayloadStatusKind::Invalid, None));
            }
        }
        let Some(block) = self.blocks.get(&hash) else {
            return Ok(Self::status(PayloadStatusKind::Syncing, None));
        };
        self.head = ChainHead {
            hash,
            number: block.summary.number,
        };
        Ok(Self::status(PayloadStatusKind::Valid, None))
    }

    async fn block(&mut self, tag: BlockTag) -> Result<Option<BlockSummary>, RunnerError> {
        let mut cursor = self.blocks.get(&self.head.hash);
        let number = match tag {
            BlockTag::Latest => return Ok(cursor.map(|b| b.summary)),
            BlockTag::Number(number) => number,
        };
        while let Some(block) = cursor {
            if block.summary.number == number {
                return Ok(Some(block.summary));
            }
            cursor = self.blocks.get(&block.parent);
        }
        Ok(None)
    }

    async fn account(
        &mut self,
        address: Address,
        keys: &[U256],
    ) -> Result<Option<Account>, RunnerError> {
        let state = self
            .blocks
            .get(&self.head.hash)
            .ok_or_else(|| RunnerError::Other("no head block".into()))?;
        Ok(state.alloc.get(&address).map(|account| Account {
            storage: keys
                .iter()
                .map(|key| (*key, account.storage_at(key)))
                .collect(),
            ..account.clone()
        }))
    }
}

/// Launches [`FakeEngineTarget`]s and counts lifecycle calls.
#[derive(Debug, Default)]
pub struct FakeLauncher {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
    pub resets: Arc<AtomicUsize>,
    pub refuse_reset: bool,
    /// Starts beyond this count fail.
    pub max_starts: Option<usize>,
    /// State changes handed to every client.
    pub changes: HashMap<B256, Alloc>,
}

#[async_trait]
impl ClientLauncher for FakeLauncher {
    type Client = FakeEngineTarget;

    async fn start(&self, spec: &ClientSpec) -> Result<Self::Client, RunnerError> {
        let started = self.started.fetch_add(1, Ordering::SeqCst);
        if self.max_starts.is_some_and(|max| started >= max) {
            return Err(RunnerError::Other("no more clients".into()));
        }
        let mut client = FakeEngineTarget::new(&spec.genesis, &spec.pre);
        client.refuse_reset = self.refuse_reset;
        client.resets = self.resets.clone();
        client.changes = self.changes.clone();
        Ok(client)
    }

    async fn stop(&self, _client: Self::Client) -> Result<(), RunnerError> {
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
