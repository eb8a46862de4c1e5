use alloy_primitives::{keccak256, Address, Bytes, B256, U64};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use crate::header::Header;

/// A validator withdrawal (post-Shanghai).
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, RlpEncodable, RlpDecodable,
)]
#[serde(rename_all = "camelCase")]
pub struct Withdrawal {
    pub index: U64,
    pub validator_index: U64,
    pub address: Address,
    pub amount: U64,
}

/// The tip of a chain. Moves only when a valid block is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainHead {
    pub hash: B256,
    pub number: u64,
}

impl std::fmt::Display for ChainHead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} ({})", self.number, self.hash)
    }
}

/// A block decoded from its RLP encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    pub header: Header,
    /// Keccak hash of the header bytes as they appear in the encoding.
    pub hash: B256,
    /// Raw transactions, EIP-2718 encoded.
    pub transactions: Vec<Bytes>,
    pub uncles: Vec<Header>,
    pub withdrawals: Option<Vec<Withdrawal>>,
}

impl DecodedBlock {
    pub fn number(&self) -> u64 {
        self.header.number_u64()
    }

    pub fn parent_hash(&self) -> B256 {
        self.header.parent_hash
    }

    pub fn head(&self) -> ChainHead {
        ChainHead {
            hash: self.hash,
            number: self.number(),
        }
    }
}

/// Decodes a full block: `[header, transactions, uncles, withdrawals?]`.
///
/// Every byte of the input must be consumed; trailing data is an error.
pub fn decode_block(raw: &[u8]) -> alloy_rlp::Result<DecodedBlock> {
    let mut buf = raw;
    let rlp_head = alloy_rlp::Header::decode(&mut buf)?;
    if !rlp_head.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if buf.len() != rlp_head.payload_length {
        return Err(alloy_rlp::Error::Custom("block length does not match payload"));
    }
    let mut body = buf;

    let header_start = body;
    let header = Header::decode(&mut body)?;
    let header_bytes = &header_start[..header_start.len() - body.len()];
    let hash = keccak256(header_bytes);

    let transactions = decode_raw_items(&mut body)?;
    let uncles = Vec::<Header>::decode(&mut body)?;
    let withdrawals = if body.is_empty() {
        None
    } else {
        Some(Vec::<Withdrawal>::decode(&mut body)?)
    };
    if !body.is_empty() {
        return Err(alloy_rlp::Error::Custom("unexpected trailing block fields"));
    }

    Ok(DecodedBlock {
        header,
        hash,
        transactions,
        uncles,
        withdrawals,
    })
}

/// Decodes a list whose items are kept as raw bytes. Legacy transactions are
/// nested lists and keep their full encoding; typed transactions are strings
/// and keep their payload.
fn decode_raw_items(buf: &mut &[u8]) -> alloy_rlp::Result<Vec<Bytes>> {
    let list_head = alloy_rlp::Header::decode(buf)?;
    if !list_head.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if buf.len() < list_head.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let mut items = &buf[..list_head.payload_length];
    *buf = &buf[list_head.payload_length..];

    let mut out = Vec::new();
    while !items.is_empty() {
        let start = items;
        let item_head = alloy_rlp::Header::decode(&mut items)?;
        if items.len() < item_head.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let header_len = start.len() - items.len();
        let item = if item_head.list {
            &start[..header_len + item_head.payload_length]
        } else {
            &items[..item_head.payload_length]
        };
        out.push(Bytes::copy_from_slice(item));
        items = &items[item_head.payload_length..];
    }
    Ok(out)
}
