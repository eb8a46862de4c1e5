//! Clients started through the hive simulator API.
use std::collections::BTreeMap;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use ef_fixtures::{Account, Alloc, EngineNewPayload, Fork, Header, TRANSITION_TIMESTAMP};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::jwt::{JwtSecret, HIVE_JWT_SECRET};
use super::rpc::{BlockSummary, BlockTag, ForkchoiceState, PayloadStatus, RpcClient};
use crate::models::error::RunnerError;
use crate::traits::{ClientLauncher, ClientSpec, EngineTarget};

/// Port of the authenticated Engine API on hive clients.
const ENGINE_PORT: u16 = 8551;

/// Activation variables understood by hive client images, in fork order.
const ACTIVATIONS: &[(Fork, &str)] = &[
    (Fork::Homestead, "HIVE_FORK_HOMESTEAD"),
    (Fork::EIP150, "HIVE_FORK_TANGERINE"),
    (Fork::EIP158, "HIVE_FORK_SPURIOUS"),
    (Fork::Byzantium, "HIVE_FORK_BYZANTIUM"),
    (Fork::Constantinople, "HIVE_FORK_CONSTANTINOPLE"),
    (Fork::ConstantinopleFix, "HIVE_FORK_PETERSBURG"),
    (Fork::Istanbul, "HIVE_FORK_ISTANBUL"),
    (Fork::Berlin, "HIVE_FORK_BERLIN"),
    (Fork::London, "HIVE_FORK_LONDON"),
    (Fork::Paris, "HIVE_TERMINAL_TOTAL_DIFFICULTY"),
    (Fork::Shanghai, "HIVE_SHANGHAI_TIMESTAMP"),
    (Fork::Cancun, "HIVE_CANCUN_TIMESTAMP"),
    (Fork::Prague, "HIVE_PRAGUE_TIMESTAMP"),
    (Fork::Osaka, "HIVE_OSAKA_TIMESTAMP"),
];

/// Environment configuring a hive client for `fork`.
///
/// Every fork up to the active one activates at genesis. A transition fork
/// activates its target fork at timestamp 15000 instead.
pub fn hive_environment(fork: Fork, chain_id: U256) -> BTreeMap<String, String> {
    let active = fork.resolved();
    let transition = active != fork;

    let mut env = BTreeMap::from([
        ("HIVE_CHAIN_ID".to_string(), chain_id.to_string()),
        ("HIVE_NETWORK_ID".to_string(), chain_id.to_string()),
    ]);
    for (activation, key) in ACTIVATIONS.iter().filter(|(f, _)| *f <= active) {
        let at = if transition && *activation == active {
            TRANSITION_TIMESTAMP
        } else {
            0
        };
        env.insert((*key).to_string(), at.to_string());
    }
    env
}

/// Genesis file for a client starting from `header` and `pre`.
pub fn genesis_json(header: &Header, pre: &Alloc, chain_id: U256) -> Value {
    let mut genesis = json!({
        "config": { "chainId": chain_id },
        "coinbase": header.coinbase,
        "difficulty": header.difficulty,
        "extraData": header.extra_data,
        "gasLimit": header.gas_limit,
        "mixHash": header.mix_hash,
        "nonce": header.nonce,
        "number": header.number,
        "parentHash": header.parent_hash,
        "timestamp": header.timestamp,
        "alloc": pre,
    });
    let optional = [
        ("baseFeePerGas", header.base_fee_per_gas.map(|v| json!(v))),
        ("blobGasUsed", header.blob_gas_used.map(|v| json!(v))),
        ("excessBlobGas", header.excess_blob_gas.map(|v| json!(v))),
        (
            "parentBeaconBlockRoot",
            header.parent_beacon_block_root.map(|v| json!(v)),
        ),
    ];
    if let Some(object) = genesis.as_object_mut() {
        for (key, value) in optional {
            if let Some(value) = value {
                object.insert(key.to_string(), value);
            }
        }
    }
    genesis
}

#[derive(Debug, Deserialize)]
struct StartedNode {
    id: String,
    ip: String,
}

/// A client container owned by one hive test.
#[derive(Debug)]
pub struct HiveClient {
    rpc: RpcClient,
    test_id: u64,
    node_id: String,
}

#[async_trait]
impl EngineTarget for HiveClient {
    async fn new_payload(
        &mut self,
        version: u8,
        payload: &EngineNewPayload,
    ) -> Result<PayloadStatus, RunnerError> {
        self.rpc.new_payload(version, payload).await
    }

    async fn forkchoice_updated(
        &mut self,
        version: u8,
        state: ForkchoiceState,
    ) -> Result<PayloadStatus, RunnerError> {
        self.rpc.forkchoice_updated(version, state).await
    }

    async fn block(&mut self, tag: BlockTag) -> Result<Option<BlockSummary>, RunnerError> {
        self.rpc.block(tag).await
    }

    async fn account(
        &mut self,
        address: Address,
        keys: &[U256],
    ) -> Result<Option<Account>, RunnerError> {
        self.rpc.account(address, keys).await
    }
}

/// Starts one hive test per client, inside a single test suite.
#[derive(Debug)]
pub struct HiveLauncher {
    http: reqwest::Client,
    simulator: String,
    suite_id: u64,
    client: String,
    rpc_timeout: Duration,
    jwt: JwtSecret,
}

impl HiveLauncher {
    /// Opens a test suite on the simulator API at `simulator`.
    pub async fn start_suite(
        simulator: &str,
        name: &str,
        client: &str,
        rpc_timeout: Duration,
    ) -> Result<Self, RunnerError> {
        let http = reqwest::Client::new();
        let simulator = simulator.trim_end_matches('/').to_string();
        let suite_id: u64 = http
            .post(format!("{simulator}/testsuite"))
            .json(&json!({ "name": name, "description": "blockchain fixture consumption" }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!("hive suite {suite_id} started for {client}");
        Ok(Self {
            http,
            simulator,
            suite_id,
            client: client.to_string(),
            rpc_timeout,
            jwt: HIVE_JWT_SECRET.parse()?,
        })
    }

    /// Closes the test suite.
    pub async fn end_suite(self) -> Result<(), RunnerError> {
        self.http
            .delete(format!("{}/testsuite/{}", self.simulator, self.suite_id))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    fn test_url(&self, test_id: u64) -> String {
        format!(
            "{}/testsuite/{}/test/{test_id}",
            self.simulator, self.suite_id
        )
    }

    async fn end_test(&self, test_id: u64, pass: bool, details: &str) -> Result<(), RunnerError> {
        self.http
            .post(self.test_url(test_id))
            .json(&json!({ "pass": pass, "details": details }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn start_node(&self, test_id: u64, spec: &ClientSpec) -> Result<StartedNode, RunnerError> {
        let config = json!({
            "client": self.client,
            "environment": hive_environment(spec.fork, spec.chain_id),
        });
        let genesis = genesis_json(&spec.genesis, &spec.pre, spec.chain_id);
        let genesis = Part::bytes(serde_json::to_vec(&genesis)?)
            .file_name("genesis.json")
            .mime_str("application/json")?;
        let form = Form::new()
            .text("config", config.to_string())
            .part("/genesis.json", genesis);

        let node = self
            .http
            .post(format!("{}/node", self.test_url(test_id)))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(node)
    }
}

#[async_trait]
impl ClientLauncher for HiveLauncher {
    type Client = HiveClient;

    async fn start(&self, spec: &ClientSpec) -> Result<HiveClient, RunnerError> {
        let test_id: u64 = self
            .http
            .post(format!(
                "{}/testsuite/{}/test",
                self.simulator, self.suite_id
            ))
            .json(&json!({ "name": spec.label, "description": format!("{} on {}", spec.client_id, spec.fork) }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let node = match self.start_node(test_id, spec).await {
            Ok(node) => node,
            Err(err) => {
                if let Err(end) = self.end_test(test_id, false, &err.to_string()).await {
                    warn!("could not end hive test {test_id}: {end}");
                }
                return Err(err);
            }
        };
        debug!("hive node {} started at {}", node.id, node.ip);

        let rpc = RpcClient::new(format!("http://{}:{ENGINE_PORT}", node.ip), self.rpc_timeout)?
            .with_jwt(self.jwt);
        Ok(HiveClient {
            rpc,
            test_id,
            node_id: node.id,
        })
    }

    async fn stop(&self, client: HiveClient) -> Result<(), RunnerError> {
        self.http
            .delete(format!("{}/node/{}", self.test_url(client.test_id), client.node_id))
            .send()
            .await?
            .error_for_status()?;
        self.end_test(client.test_id, true, "client stopped").await
    }
}
