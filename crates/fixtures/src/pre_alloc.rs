use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::account::{normalize_alloc, Alloc};
use crate::error::FixtureError;
use crate::fixture::BlockchainFixture;
use crate::fork::Fork;
use crate::header::Header;

/// Name of the directory holding group files next to grouped fixtures.
pub const PRE_ALLOC_DIR: &str = "pre_alloc";

/// Content address of a pre-allocation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreAllocHash(pub B256);

impl fmt::Display for PreAllocHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block environment shared by the members of a group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub current_coinbase: Address,
    pub current_gas_limit: U256,
    pub current_number: U256,
    pub current_timestamp: U256,
    #[serde(default)]
    pub current_difficulty: U256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_random: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_base_fee: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_excess_blob_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_blob_gas_used: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_beacon_block_root: Option<B256>,
    #[serde(default)]
    pub extra_data: Bytes,
}

impl From<&Header> for Environment {
    fn from(genesis: &Header) -> Self {
        Self {
            current_coinbase: genesis.coinbase,
            current_gas_limit: genesis.gas_limit,
            current_number: genesis.number,
            current_timestamp: genesis.timestamp,
            current_difficulty: genesis.difficulty,
            current_random: Some(genesis.mix_hash),
            current_base_fee: genesis.base_fee_per_gas,
            current_excess_blob_gas: genesis.excess_blob_gas,
            current_blob_gas_used: genesis.blob_gas_used,
            parent_beacon_block_root: genesis.parent_beacon_block_root,
            extra_data: genesis.extra_data.clone(),
        }
    }
}

/// Fixtures sharing the same fork, environment and pre-state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAllocGroup {
    pub pre: Alloc,
    pub environment: Environment,
    pub network: Fork,
    #[serde(default)]
    pub test_ids: Vec<String>,
    #[serde(default, rename = "test_count")]
    pub test_count: usize,
}

#[derive(Serialize)]
struct GroupKeyInput<'a> {
    network: Fork,
    environment: &'a Environment,
    pre: Alloc,
}

/// Computes the content address of `(network, environment, pre)`. Zero-valued
/// storage slots do not contribute.
pub fn group_key(
    network: Fork,
    environment: &Environment,
    pre: &Alloc,
) -> Result<PreAllocHash, FixtureError> {
    let input = GroupKeyInput {
        network,
        environment,
        pre: normalize_alloc(pre),
    };
    let encoded = serde_json::to_vec(&input)
        .map_err(|err| FixtureError::Construction(format!("could not encode group key: {err}")))?;
    Ok(PreAllocHash(keccak256(encoded)))
}

impl PreAllocGroup {
    pub fn key(&self) -> Result<PreAllocHash, FixtureError> {
        group_key(self.network, &self.environment, &self.pre)
    }

    /// Path of the group file for `hash` under a fixtures directory.
    pub fn path(fixtures_dir: &Path, hash: &PreAllocHash) -> PathBuf {
        fixtures_dir.join(PRE_ALLOC_DIR).join(format!("{hash}.json"))
    }

    /// Loads the group file for `hash`.
    pub fn load(fixtures_dir: &Path, hash: &PreAllocHash) -> Result<Self, FixtureError> {
        let path = Self::path(fixtures_dir, hash);
        let content = fs::read_to_string(&path).map_err(|error| FixtureError::Io {
            path: path.clone(),
            error: error.to_string(),
        })?;
        serde_json::from_str(&content).map_err(|error| FixtureError::CouldNotDeserialize {
            path,
            error: error.to_string(),
        })
    }
}

/// Buckets fixtures carrying a full pre-state by group key. Fixtures without
/// a `pre` are ignored.
pub fn group_fixtures<'a>(
    fixtures: impl IntoIterator<Item = (&'a str, &'a BlockchainFixture)>,
) -> Result<BTreeMap<PreAllocHash, PreAllocGroup>, FixtureError> {
    let mut groups: BTreeMap<PreAllocHash, PreAllocGroup> = BTreeMap::new();
    for (test_id, fixture) in fixtures {
        let Some(pre) = &fixture.pre else {
            continue;
        };
        let environment = Environment::from(&fixture.genesis_block_header);
        let key = group_key(fixture.network, &environment, pre)?;
        let group = groups.entry(key).or_insert_with(|| PreAllocGroup {
            pre: pre.clone(),
            environment,
            network: fixture.network,
            test_ids: Vec::new(),
            test_count: 0,
        });
        group.test_ids.push(test_id.to_string());
        group.test_count += 1;
    }
    Ok(groups)
}
