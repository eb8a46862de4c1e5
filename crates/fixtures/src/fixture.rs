use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use alloy_primitives::{hex, Bytes, B256, U256};
use serde::{Deserialize, Deserializer};

use crate::account::{Alloc, AllocDiff};
use crate::block::{ChainHead, Withdrawal};
use crate::error::FixtureError;
use crate::exceptions::ExceptionSet;
use crate::fork::Fork;
use crate::header::Header;
use crate::payload::EngineNewPayload;
use crate::pre_alloc::PreAllocHash;

/// A fixture file: test names mapped to fixtures.
pub type FixtureFile = BTreeMap<String, BlockchainFixture>;

/// A blockchain fixture, in its direct (`blocks`), Engine-API
/// (`engineNewPayloads`) or grouped (`preHash` + `postStateDiff`) form.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainFixture {
    pub network: Fork,
    pub genesis_block_header: Header,
    #[serde(default, rename = "genesisRLP")]
    pub genesis_rlp: Option<Bytes>,
    #[serde(default)]
    pub pre: Option<Alloc>,
    #[serde(default)]
    pub pre_hash: Option<PreAllocHash>,
    #[serde(default)]
    pub blocks: Vec<FixtureBlock>,
    #[serde(default)]
    pub engine_new_payloads: Vec<EngineNewPayload>,
    #[serde(default, deserialize_with = "deserialize_fcu_version")]
    pub engine_fcu_version: Option<u8>,
    pub lastblockhash: B256,
    #[serde(default, alias = "post")]
    pub post_state: Option<Alloc>,
    #[serde(default)]
    pub post_state_hash: Option<B256>,
    #[serde(default)]
    pub post_state_diff: Option<AllocDiff>,
    #[serde(default)]
    pub config: Option<FixtureConfig>,
    #[serde(default)]
    pub seal_engine: Option<String>,
    #[serde(default, rename = "_info")]
    pub info: Option<serde_json::Value>,
}

/// Chain configuration carried by a fixture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureConfig {
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_chain_id")]
    pub chainid: U256,
    #[serde(default)]
    pub blob_schedule: Option<serde_json::Value>,
}

fn default_chain_id() -> U256 {
    U256::from(1)
}

/// A block of a direct blockchain fixture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureBlock {
    /// Hex encoding of the block. Kept as text since invalid blocks are not
    /// guaranteed to be well-formed hex.
    pub rlp: String,
    #[serde(default)]
    pub block_header: Option<Header>,
    #[serde(default)]
    pub transactions: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub uncle_headers: Option<Vec<Header>>,
    #[serde(default)]
    pub withdrawals: Option<Vec<Withdrawal>>,
    #[serde(default)]
    pub expect_exception: Option<ExceptionSet>,
    #[serde(default)]
    pub rlp_decoded: Option<serde_json::Value>,
}

impl FixtureBlock {
    /// Returns the raw block bytes.
    pub fn rlp_bytes(&self) -> Result<Bytes, hex::FromHexError> {
        hex::decode(self.rlp.trim()).map(Bytes::from)
    }

    pub fn is_valid(&self) -> bool {
        self.expect_exception.is_none()
    }
}

/// The expected post-state of a fixture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedPost<'a> {
    Full(&'a Alloc),
    Diff(&'a AllocDiff),
    Root(B256),
}

impl BlockchainFixture {
    /// Hash of the genesis block, as declared or computed from the header.
    pub fn genesis_hash(&self) -> B256 {
        self.genesis_block_header
            .hash
            .unwrap_or_else(|| self.genesis_block_header.hash_slow())
    }

    pub fn genesis_head(&self) -> ChainHead {
        ChainHead {
            hash: self.genesis_hash(),
            number: self.genesis_block_header.number_u64(),
        }
    }

    pub fn is_engine(&self) -> bool {
        !self.engine_new_payloads.is_empty()
    }

    /// The head the chain must end on. The number is looked up among the
    /// fixture's headers, falling back to the count of valid blocks.
    pub fn expected_head(&self) -> ChainHead {
        let hash = self.lastblockhash;
        if hash == self.genesis_hash() {
            return self.genesis_head();
        }
        let from_payloads = self
            .engine_new_payloads
            .iter()
            .find(|p| p.block_hash() == hash)
            .map(|p| p.execution_payload.number());
        let from_blocks = || {
            self.blocks
                .iter()
                .filter_map(|b| b.block_header.as_ref())
                .find(|h| h.hash == Some(hash))
                .map(Header::number_u64)
        };
        let number = from_payloads.or_else(from_blocks).unwrap_or_else(|| {
            let valid = if self.is_engine() {
                self.engine_new_payloads
                    .iter()
                    .filter(|p| p.expects_valid())
                    .count()
            } else {
                self.blocks.iter().filter(|b| b.is_valid()).count()
            };
            self.genesis_block_header.number_u64() + valid as u64
        });
        ChainHead { hash, number }
    }

    /// Returns the expected post-state, preferring a full alloc over a diff
    /// over a bare root.
    pub fn expected_post(&self) -> Result<ExpectedPost<'_>, FixtureError> {
        if let Some(post) = &self.post_state {
            return Ok(ExpectedPost::Full(post));
        }
        if let Some(diff) = &self.post_state_diff {
            return Ok(ExpectedPost::Diff(diff));
        }
        if let Some(root) = self.post_state_hash {
            return Ok(ExpectedPost::Root(root));
        }
        Err(FixtureError::Construction(
            "fixture has no postState, postStateDiff or postStateHash".into(),
        ))
    }

    /// The forkchoice version to use after an accepted payload.
    pub fn forkchoice_version(&self, payload: &EngineNewPayload) -> Option<u8> {
        payload
            .forkchoice_updated_version
            .or(self.engine_fcu_version)
            .or_else(|| payload.fork(self.network).forkchoice_version())
    }

    /// Checks the rules a fixture must satisfy before it can be consumed.
    pub fn validate(&self) -> Result<(), FixtureError> {
        if self.pre.is_none() && self.pre_hash.is_none() {
            return Err(FixtureError::Construction(
                "fixture has neither pre nor preHash".into(),
            ));
        }
        if self.post_state_diff.is_some() && self.pre_hash.is_none() {
            return Err(FixtureError::Construction(
                "postStateDiff requires a preHash".into(),
            ));
        }
        if self.is_engine() && !self.blocks.is_empty() {
            return Err(FixtureError::Construction(
                "fixture mixes blocks and engineNewPayloads".into(),
            ));
        }
        for (index, payload) in self.engine_new_payloads.iter().enumerate() {
            if payload.error_code.is_some() && payload.validation_error.is_some() {
                return Err(FixtureError::Construction(format!(
                    "payload {index} carries both errorCode and validationError"
                )));
            }
        }
        self.expected_post()?;
        Ok(())
    }
}

fn deserialize_fcu_version<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<u8>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Version {
        Number(u8),
        String(String),
    }
    match Option::<Version>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Version::Number(n)) => Ok(Some(n)),
        Some(Version::String(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Loads and validates every fixture of a JSON file.
pub fn load_fixture_file(path: &Path) -> Result<FixtureFile, FixtureError> {
    let content = fs::read_to_string(path).map_err(|error| FixtureError::Io {
        path: path.into(),
        error: error.to_string(),
    })?;
    let fixtures: FixtureFile =
        serde_json::from_str(&content).map_err(|error| FixtureError::CouldNotDeserialize {
            path: path.into(),
            error: error.to_string(),
        })?;
    for (name, fixture) in &fixtures {
        fixture.validate().map_err(|error| FixtureError::CouldNotDeserialize {
            path: path.into(),
            error: format!("{name}: {error}"),
        })?;
    }
    Ok(fixtures)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::payload::tests::payload_json;
    use serde_json::json;

    pub(crate) const GENESIS_HASH: &str =
        "0x4e1a0ec4a4d9a0b2a3d6a56a4d8e8aaab1a8b3cd4f6e2b3d7c3c8b1a6a5a7d9e";

    pub(crate) fn fixture_json() -> serde_json::Value {
        json!({
            "network": "Cancun",
            "genesisBlockHeader": {
                "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "uncleHash": "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347",
                "coinbase": "0x2adc25665018aa1fe0e6bc666dac8fc2697ff9ba",
                "stateRoot": "0x0000000000000000000000000000000000000000000000000000000000000011",
                "transactionsTrie": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
                "receiptTrie": "0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421",
                "bloom": format!("0x{}", "00".repeat(256)),
                "difficulty": "0x00",
                "number": "0x00",
                "gasLimit": "0x016345785d8a0000",
                "gasUsed": "0x00",
                "timestamp": "0x00",
                "extraData": "0x00",
                "mixHash": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "nonce": "0x0000000000000000",
                "hash": GENESIS_HASH
            },
            "pre": {
                "0xa94f5374fce5edbc8e2a8697c15331677e6ebf0b": {
                    "balance": "0x3635c9adc5dea00000",
                    "code": "0x",
                    "nonce": "0x00",
                    "storage": {}
                }
            },
            "blocks": [],
            "lastblockhash": GENESIS_HASH,
            "postState": {
                "0xa94f5374fce5edbc8e2a8697c15331677e6ebf0b": {
                    "balance": "0x3635c9adc5dea00000",
                    "code": "0x",
                    "nonce": "0x00",
                    "storage": {}
                }
            },
            "config": {"network": "Cancun", "chainid": "0x01"},
            "sealEngine": "NoProof"
        })
    }

    #[test]
    fn test_deserialize_fixture() {
        // Given
        let mut input = fixture_json();
        input["blocks"] = json!([
            {"rlp": "0xzz", "expectException": "BlockException.RLP_STRUCTURES_ENCODING"}
        ]);

        // When
        let fixture: BlockchainFixture = serde_json::from_value(input).unwrap();

        // Then
        assert!(fixture.validate().is_ok());
        assert_eq!(fixture.network, Fork::Cancun);
        assert_eq!(fixture.expected_head(), fixture.genesis_head());
        assert!(fixture.blocks[0].rlp_bytes().is_err());
        assert!(matches!(fixture.expected_post(), Ok(ExpectedPost::Full(_))));
    }

    #[test]
    fn test_post_alias() {
        // Given
        let mut input = fixture_json();
        let post = input["postState"].take();
        input.as_object_mut().unwrap().remove("postState");
        input["post"] = post;

        // When
        let fixture: BlockchainFixture = serde_json::from_value(input).unwrap();

        // Then
        assert!(fixture.post_state.is_some());
    }

    #[test]
    fn test_reject_error_code_with_validation_error() {
        // Given
        let mut input = fixture_json();
        input["engineNewPayloads"] = json!([payload_json(json!({
            "errorCode": -32602,
            "validationError": "BlockException.INVALID_STATE_ROOT"
        }))]);
        let fixture: BlockchainFixture = serde_json::from_value(input).unwrap();

        // When
        let result = fixture.validate();

        // Then
        assert!(matches!(result, Err(FixtureError::Construction(_))));
    }

    #[test]
    fn test_reject_missing_post() {
        // Given
        let mut input = fixture_json();
        input.as_object_mut().unwrap().remove("postState");
        let fixture: BlockchainFixture = serde_json::from_value(input).unwrap();

        // Then
        assert!(fixture.validate().is_err());
    }

    #[test]
    fn test_expected_head_from_payloads() {
        // Given
        let mut input = fixture_json();
        input["engineNewPayloads"] = json!([payload_json(json!({}))]);
        input["lastblockhash"] =
            json!("0x0000000000000000000000000000000000000000000000000000000000000004");
        input["engineFcuVersion"] = json!("3");
        let fixture: BlockchainFixture = serde_json::from_value(input).unwrap();

        // When
        let head = fixture.expected_head();

        // Then
        assert_eq!(head.number, 1);
        assert_eq!(
            fixture.forkchoice_version(&fixture.engine_new_payloads[0]),
            Some(3)
        );
    }
}
