use alloy_primitives::{keccak256, Address, Bloom, Bytes, B256, B64, U256};
use alloy_rlp::{Decodable, Encodable};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

/// A block header as found in blockchain fixtures.
///
/// Optional fields follow fork activation order and are encoded as trailing
/// RLP items, each one only when every previous optional field is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_trie: B256,
    pub receipt_trie: B256,
    pub bloom: Bloom,
    pub difficulty: U256,
    pub number: U256,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub timestamp: U256,
    pub extra_data: Bytes,
    pub mix_hash: B256,
    pub nonce: B64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub withdrawals_root: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_gas_used: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excess_blob_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_beacon_block_root: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_hash: Option<B256>,
    /// Hash declared by the fixture. Not part of the encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<B256>,
}

impl Header {
    /// Returns the block number, saturated to `u64`.
    pub fn number_u64(&self) -> u64 {
        self.number.saturating_to()
    }

    /// Computes the header hash from its RLP encoding.
    pub fn hash_slow(&self) -> B256 {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        keccak256(&out)
    }

    fn payload_length(&self) -> usize {
        let mut length = self.parent_hash.length()
            + self.uncle_hash.length()
            + self.coinbase.length()
            + self.state_root.length()
            + self.transactions_trie.length()
            + self.receipt_trie.length()
            + self.bloom.length()
            + self.difficulty.length()
            + self.number.length()
            + self.gas_limit.length()
            + self.gas_used.length()
            + self.timestamp.length()
            + self.extra_data.length()
            + self.mix_hash.length()
            + self.nonce.length();
        length += self.base_fee_per_gas.map(|v| v.length()).unwrap_or_default();
        length += self.withdrawals_root.map(|v| v.length()).unwrap_or_default();
        length += self.blob_gas_used.map(|v| v.length()).unwrap_or_default();
        length += self.excess_blob_gas.map(|v| v.length()).unwrap_or_default();
        length += self
            .parent_beacon_block_root
            .map(|v| v.length())
            .unwrap_or_default();
        length += self.requests_hash.map(|v| v.length()).unwrap_or_default();
        length
    }
}

impl Encodable for Header {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        alloy_rlp::Header {
            list: true,
            payload_length: self.payload_length(),
        }
        .encode(out);
        self.parent_hash.encode(out);
        self.uncle_hash.encode(out);
        self.coinbase.encode(out);
        self.state_root.encode(out);
        self.transactions_trie.encode(out);
        self.receipt_trie.encode(out);
        self.bloom.encode(out);
        self.difficulty.encode(out);
        self.number.encode(out);
        self.gas_limit.encode(out);
        self.gas_used.encode(out);
        self.timestamp.encode(out);
        self.extra_data.encode(out);
        self.mix_hash.encode(out);
        self.nonce.encode(out);
        if let Some(v) = self.base_fee_per_gas {
            v.encode(out);
        }
        if let Some(v) = self.withdrawals_root {
            v.encode(out);
        }
        if let Some(v) = self.blob_gas_used {
            v.encode(out);
        }
        if let Some(v) = self.excess_blob_gas {
            v.encode(out);
        }
        if let Some(v) = self.parent_beacon_block_root {
            v.encode(out);
        }
        if let Some(v) = self.requests_hash {
            v.encode(out);
        }
    }

    fn length(&self) -> usize {
        let payload_length = self.payload_length();
        payload_length + alloy_rlp::length_of_length(payload_length)
    }
}

impl Decodable for Header {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let rlp_head = alloy_rlp::Header::decode(buf)?;
        if !rlp_head.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < rlp_head.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let mut body = &buf[..rlp_head.payload_length];

        let mut header = Self {
            parent_hash: Decodable::decode(&mut body)?,
            uncle_hash: Decodable::decode(&mut body)?,
            coinbase: Decodable::decode(&mut body)?,
            state_root: Decodable::decode(&mut body)?,
            transactions_trie: Decodable::decode(&mut body)?,
            receipt_trie: Decodable::decode(&mut body)?,
            bloom: Decodable::decode(&mut body)?,
            difficulty: Decodable::decode(&mut body)?,
            number: Decodable::decode(&mut body)?,
            gas_limit: Decodable::decode(&mut body)?,
            gas_used: Decodable::decode(&mut body)?,
            timestamp: Decodable::decode(&mut body)?,
            extra_data: Decodable::decode(&mut body)?,
            mix_hash: Decodable::decode(&mut body)?,
            nonce: Decodable::decode(&mut body)?,
            ..Default::default()
        };
        if !body.is_empty() {
            header.base_fee_per_gas = Some(Decodable::decode(&mut body)?);
        }
        if !body.is_empty() {
            header.withdrawals_root = Some(Decodable::decode(&mut body)?);
        }
        if !body.is_empty() {
            header.blob_gas_used = Some(Decodable::decode(&mut body)?);
        }
        if !body.is_empty() {
            header.excess_blob_gas = Some(Decodable::decode(&mut body)?);
        }
        if !body.is_empty() {
            header.parent_beacon_block_root = Some(Decodable::decode(&mut body)?);
        }
        if !body.is_empty() {
            header.requests_hash = Some(Decodable::decode(&mut body)?);
        }
        if !body.is_empty() {
            return Err(alloy_rlp::Error::ListLengthMismatch {
                expected: rlp_head.payload_length,
                got: rlp_head.payload_length - body.len(),
            });
        }

        *buf = &buf[rlp_head.payload_length..];
        Ok(header)
    }
}
