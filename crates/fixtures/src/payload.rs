use alloy_primitives::{Address, Bloom, Bytes, B256, U256, U64};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::block::Withdrawal;
use crate::exceptions::ExceptionSet;
use crate::fork::Fork;

/// An execution payload as exchanged over the Engine API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPayload {
    pub parent_hash: B256,
    pub fee_recipient: Address,
    pub state_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub prev_randao: B256,
    pub block_number: U64,
    pub gas_limit: U64,
    pub gas_used: U64,
    pub timestamp: U64,
    pub extra_data: Bytes,
    pub base_fee_per_gas: U256,
    pub block_hash: B256,
    pub transactions: Vec<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawals: Option<Vec<Withdrawal>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_gas_used: Option<U64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excess_blob_gas: Option<U64>,
}

impl ExecutionPayload {
    pub fn number(&self) -> u64 {
        self.block_number.to::<u64>()
    }

    pub fn timestamp_u64(&self) -> u64 {
        self.timestamp.to::<u64>()
    }
}

/// Why a declared `engine_newPayload` version is unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VersionMismatch {
    #[error("declared newPayload version {declared} is below V{required} required by the fork")]
    BelowFork { declared: u8, required: u8 },
    #[error("declared newPayload version {declared} is below V{warranted} required by the payload fields")]
    BelowFields { declared: u8, warranted: u8 },
    #[error("declared newPayload version {declared} is above V{warranted} warranted by the payload fields")]
    AboveFields { declared: u8, warranted: u8 },
    #[error("fork {0} has no Engine API")]
    PreMerge(Fork),
}

/// One `engine_newPayload` call of an Engine-API fixture together with its
/// expected outcome.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineNewPayload {
    pub execution_payload: ExecutionPayload,
    #[serde(alias = "newPayloadVersion", deserialize_with = "deserialize_number")]
    pub version: u8,
    #[serde(default)]
    pub blob_versioned_hashes: Option<Vec<B256>>,
    #[serde(default)]
    pub parent_beacon_block_root: Option<B256>,
    #[serde(default)]
    pub execution_requests: Option<Vec<Bytes>>,
    #[serde(default)]
    pub validation_error: Option<ExceptionSet>,
    #[serde(default, deserialize_with = "deserialize_optional_number")]
    pub error_code: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_optional_number")]
    pub forkchoice_updated_version: Option<u8>,
}

impl EngineNewPayload {
    pub fn block_hash(&self) -> B256 {
        self.execution_payload.block_hash
    }

    /// The fork whose rules apply to this payload under `network`.
    pub fn fork(&self, network: Fork) -> Fork {
        network.at(self.execution_payload.timestamp_u64())
    }

    /// Whether the payload is expected to be accepted.
    pub fn expects_valid(&self) -> bool {
        self.validation_error.is_none() && self.error_code.is_none()
    }

    /// The lowest version whose parameter list carries every field present in
    /// this entry.
    pub fn fields_version(&self) -> u8 {
        if self.execution_requests.is_some() {
            4
        } else if self.blob_versioned_hashes.is_some()
            || self.parent_beacon_block_root.is_some()
            || self.execution_payload.blob_gas_used.is_some()
            || self.execution_payload.excess_blob_gas.is_some()
        {
            3
        } else if self.execution_payload.withdrawals.is_some() {
            2
        } else {
            1
        }
    }

    /// Checks the declared version against the fork active at the payload
    /// timestamp and against the payload fields. Entries that expect a
    /// JSON-RPC error are exempt, since a wrong version is frequently the very
    /// thing they exercise.
    pub fn check_version(&self, network: Fork) -> Result<(), VersionMismatch> {
        if self.error_code.is_some() {
            return Ok(());
        }
        let fork = self.fork(network);
        let required = fork.payload_version().ok_or(VersionMismatch::PreMerge(fork))?;
        let warranted = self.fields_version();
        let declared = self.version;
        if declared < required {
            return Err(VersionMismatch::BelowFork { declared, required });
        }
        if declared < warranted {
            return Err(VersionMismatch::BelowFields {
                declared,
                warranted,
            });
        }
        if declared > warranted.max(required) {
            return Err(VersionMismatch::AboveFields {
                declared,
                warranted,
            });
        }
        Ok(())
    }

    /// Builds the positional JSON-RPC parameters for the declared version.
    pub fn params(&self) -> Vec<Value> {
        let mut params = vec![json!(self.execution_payload)];
        if self.version >= 3 {
            params.push(json!(self.blob_versioned_hashes.clone().unwrap_or_default()));
            params.push(json!(self.parent_beacon_block_root.unwrap_or_default()));
        }
        if self.version >= 4 {
            params.push(json!(self.execution_requests.clone().unwrap_or_default()));
        }
        params
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

impl NumberOrString {
    fn parse<T: TryFrom<i64>, E: de::Error>(self) -> Result<T, E> {
        let value = match self {
            Self::Number(n) => n,
            Self::String(s) => {
                let s = s.trim();
                match s.strip_prefix("0x") {
                    Some(hex) => i64::from_str_radix(hex, 16),
                    None => s.parse(),
                }
                .map_err(|err| E::custom(format!("invalid number {s}: {err}")))?
            }
        };
        T::try_from(value).map_err(|_| E::custom(format!("number {value} out of range")))
    }
}

fn deserialize_number<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    NumberOrString::deserialize(deserializer)?.parse()
}

fn deserialize_optional_number<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<i64>,
{
    Option::<NumberOrString>::deserialize(deserializer)?
        .map(NumberOrString::parse)
        .transpose()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rstest::rstest;

    pub(crate) fn payload_json(extra: Value) -> Value {
        let mut entry = json!({
            "executionPayload": {
                "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000001",
                "feeRecipient": "0x2adc25665018aa1fe0e6bc666dac8fc2697ff9ba",
                "stateRoot": "0x0000000000000000000000000000000000000000000000000000000000000002",
                "receiptsRoot": "0x0000000000000000000000000000000000000000000000000000000000000003",
                "logsBloom": format!("0x{}", "00".repeat(256)),
                "prevRandao": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "blockNumber": "0x1",
                "gasLimit": "0x1c9c380",
                "gasUsed": "0x0",
                "timestamp": "0xc",
                "extraData": "0x",
                "baseFeePerGas": "0x7",
                "blockHash": "0x0000000000000000000000000000000000000000000000000000000000000004",
                "transactions": []
            },
            "version": "1"
        });
        if let (Some(entry), Some(extra)) = (entry.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                if key == "executionPayload" {
                    if let (Some(payload), Some(fields)) = (
                        entry.get_mut("executionPayload").and_then(Value::as_object_mut),
                        value.as_object(),
                    ) {
                        payload.extend(fields.clone());
                    }
                } else {
                    if key == "newPayloadVersion" {
                        entry.remove("version");
                    }
                    entry.insert(key.clone(), value.clone());
                }
            }
        }
        entry
    }

    fn cancun_extra(version: Value) -> Value {
        json!({
            "executionPayload": {"withdrawals": [], "blobGasUsed": "0x0", "excessBlobGas": "0x0"},
            "blobVersionedHashes": [],
            "parentBeaconBlockRoot": "0x0000000000000000000000000000000000000000000000000000000000000000",
            "newPayloadVersion": version,
        })
    }

    #[test]
    fn test_deserialize_payload() {
        // Given
        let input = payload_json(json!({"validationError": "BlockException.INVALID_STATE_ROOT"}));

        // When
        let entry: EngineNewPayload = serde_json::from_value(input).unwrap();

        // Then
        assert_eq!(entry.version, 1);
        assert_eq!(entry.execution_payload.number(), 1);
        assert!(!entry.expects_valid());
        assert_eq!(entry.params().len(), 1);
    }

    #[rstest]
    #[case(json!(3), Fork::Cancun, Ok(()))]
    #[case(json!("3"), Fork::Cancun, Ok(()))]
    #[case(json!(2), Fork::Cancun, Err(VersionMismatch::BelowFork { declared: 2, required: 3 }))]
    #[case(json!(4), Fork::Cancun, Err(VersionMismatch::AboveFields { declared: 4, warranted: 3 }))]
    #[case(json!(3), Fork::Shanghai, Ok(()))]
    fn test_check_version(
        #[case] version: Value,
        #[case] fork: Fork,
        #[case] expected: Result<(), VersionMismatch>,
    ) {
        // Given
        let entry: EngineNewPayload =
            serde_json::from_value(payload_json(cancun_extra(version))).unwrap();

        // When
        let result = entry.check_version(fork);

        // Then
        assert_eq!(result, expected);
    }

    #[rstest]
    #[case(14_999, 2, Ok(()))]
    #[case(15_000, 2, Err(VersionMismatch::BelowFork { declared: 2, required: 3 }))]
    fn test_check_version_across_transition(
        #[case] timestamp: u64,
        #[case] version: u8,
        #[case] expected: Result<(), VersionMismatch>,
    ) {
        // Given
        let entry: EngineNewPayload = serde_json::from_value(payload_json(json!({
            "executionPayload": {"withdrawals": [], "timestamp": format!("{timestamp:#x}")},
            "version": version,
        })))
        .unwrap();

        // When
        let result = entry.check_version(Fork::ShanghaiToCancunAtTime15k);

        // Then
        assert_eq!(result, expected);
    }

    #[test]
    fn test_check_version_fields_need_higher_version() {
        // Given
        let entry: EngineNewPayload = serde_json::from_value(payload_json(
            json!({"executionPayload": {"withdrawals": []}, "version": 1}),
        ))
        .unwrap();

        // When
        let result = entry.check_version(Fork::Paris);

        // Then
        assert_eq!(
            result,
            Err(VersionMismatch::BelowFields {
                declared: 1,
                warranted: 2
            })
        );
    }

    #[test]
    fn test_error_code_skips_version_check() {
        // Given
        let entry: EngineNewPayload = serde_json::from_value(payload_json(
            json!({"version": "2", "errorCode": "-32602"}),
        ))
        .unwrap();

        // Then
        assert_eq!(entry.error_code, Some(-32602));
        assert!(entry.check_version(Fork::Cancun).is_ok());
    }

    #[test]
    fn test_v4_params() {
        // Given
        let mut input = payload_json(cancun_extra(json!(4)));
        input["executionRequests"] = json!(["0x00", "0x01"]);
        let entry: EngineNewPayload = serde_json::from_value(input).unwrap();

        // When
        let params = entry.params();

        // Then
        assert!(entry.check_version(Fork::Prague).is_ok());
        assert_eq!(params.len(), 4);
        assert_eq!(params[3], json!(["0x00", "0x01"]));
    }
}
