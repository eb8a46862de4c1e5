use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::FixtureError;

/// Reasons a transaction can make its block invalid.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum TransactionException {
    SenderNotEoa,
    AddressTooShort,
    AddressTooLong,
    NonceMismatchTooHigh,
    NonceMismatchTooLow,
    NonceTooBig,
    NonceIsMax,
    NonceOverflow,
    GaslimitOverflow,
    ValueOverflow,
    GaspriceOverflow,
    GaslimitPriceProductOverflow,
    InvalidSignatureVrs,
    RlpInvalidSignatureR,
    RlpInvalidSignatureS,
    RlpLeadingZerosGaslimit,
    RlpLeadingZerosGasprice,
    RlpLeadingZerosValue,
    RlpLeadingZerosNonce,
    RlpLeadingZerosR,
    RlpLeadingZerosS,
    RlpLeadingZerosV,
    RlpLeadingZerosBasefee,
    RlpLeadingZerosPriorityFee,
    RlpLeadingZerosData,
    RlpLeadingZerosNonceSize,
    RlpTooFewElements,
    RlpTooManyElements,
    RlpInvalidData,
    RlpInvalidGasLimit,
    RlpInvalidNonce,
    RlpInvalidTo,
    RlpInvalidAccessListAddressTooLong,
    RlpInvalidAccessListAddressTooShort,
    RlpInvalidAccessListStorageTooLong,
    RlpInvalidAccessListStorageTooShort,
    RlpInvalidHeader,
    RlpInvalidValue,
    EcRecoveryFail,
    InsufficientAccountFunds,
    InsufficientMaxFeePerGas,
    PriorityGreaterThanMaxFeePerGas,
    PriorityOverflow,
    IntrinsicGasTooLow,
    IntrinsicGasBelowFloorGasCost,
    InitcodeSizeExceeded,
    GasAllowanceExceeded,
    GasLimitExceedsMaximum,
    #[strum(to_string = "TYPE_1_TX_PRE_FORK")]
    Type1TxPreFork,
    #[strum(to_string = "TYPE_2_TX_PRE_FORK")]
    Type2TxPreFork,
    #[strum(to_string = "TYPE_3_TX_PRE_FORK")]
    Type3TxPreFork,
    #[strum(to_string = "TYPE_3_TX_ZERO_BLOBS_PRE_FORK")]
    Type3TxZeroBlobsPreFork,
    #[strum(to_string = "TYPE_3_TX_INVALID_BLOB_VERSIONED_HASH")]
    Type3TxInvalidBlobVersionedHash,
    #[strum(to_string = "TYPE_3_TX_WITH_FULL_BLOBS")]
    Type3TxWithFullBlobs,
    #[strum(to_string = "TYPE_3_TX_BLOB_COUNT_EXCEEDED")]
    Type3TxBlobCountExceeded,
    #[strum(to_string = "TYPE_3_TX_CONTRACT_CREATION")]
    Type3TxContractCreation,
    #[strum(to_string = "TYPE_3_TX_MAX_BLOB_GAS_ALLOWANCE_EXCEEDED")]
    Type3TxMaxBlobGasAllowanceExceeded,
    #[strum(to_string = "TYPE_3_TX_ZERO_BLOBS")]
    Type3TxZeroBlobs,
    InsufficientMaxFeePerBlobGas,
    #[strum(to_string = "TYPE_4_EMPTY_AUTHORIZATION_LIST")]
    Type4EmptyAuthorizationList,
    #[strum(to_string = "TYPE_4_TX_CONTRACT_CREATION")]
    Type4TxContractCreation,
    #[strum(to_string = "TYPE_4_TX_PRE_FORK")]
    Type4TxPreFork,
    #[strum(to_string = "TYPE_4_INVALID_AUTHORITY_SIGNATURE")]
    Type4InvalidAuthoritySignature,
    #[strum(to_string = "TYPE_4_INVALID_AUTHORITY_SIGNATURE_S_TOO_HIGH")]
    Type4InvalidAuthoritySignatureSTooHigh,
    #[strum(to_string = "TYPE_4_INVALID_AUTHORIZATION_FORMAT")]
    Type4InvalidAuthorizationFormat,
    TypeNotSupported,
}

/// Reasons a block can be invalid independently of its transactions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockException {
    IncorrectBlockFormat,
    BlobGasUsedAboveLimit,
    IncorrectBlobGasUsed,
    IncorrectExcessBlobGas,
    RlpStructuresEncoding,
    RlpWithdrawalsNotRead,
    #[strum(to_string = "RLP_INVALID_FIELD_OVERFLOW_64")]
    RlpInvalidFieldOverflow64,
    RlpInvalidAddress,
    RlpBlockLimitExceeded,
    InvalidRequests,
    ImportImpossibleUnclesOverParis,
    ImportImpossibleDifficultyOverParis,
    UnknownParent,
    UnknownParentZero,
    GaslimitTooBig,
    InvalidBlockNumber,
    InvalidBlockTimestampOlderThanParent,
    InvalidBasefeePerGas,
    InvalidGaslimit,
    InvalidGasUsed,
    InvalidGasUsedAboveLimit,
    InvalidStateRoot,
    InvalidReceiptsRoot,
    InvalidTransactionsRoot,
    InvalidUnclesHash,
    InvalidLogBloom,
    InvalidWithdrawalsRoot,
    InvalidBlockHash,
    ExtraDataTooBig,
    InvalidDepositEventLayout,
    SystemContractEmpty,
    SystemContractCallFailed,
}

/// Reasons an EOF container is invalid.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[allow(clippy::upper_case_acronyms)]
pub enum EOFException {
    DefaultException,
    UndefinedException,
    UndefinedInstruction,
    UnknownVersion,
    IncompleteMagic,
    InvalidMagic,
    InvalidVersion,
    InvalidNonReturningFlag,
    InvalidRjumpDestination,
    MissingTypeHeader,
    InvalidTypeSectionSize,
    InvalidTypeBody,
    MissingCodeHeader,
    InvalidCodeSection,
    IncompleteCodeHeader,
    IncompleteDataHeader,
    ZeroSectionSize,
    MissingDataSection,
    IncompleteContainer,
    InvalidSectionBodiesSize,
    TrailingBytes,
    MissingTerminator,
    MissingHeadersTerminator,
    InvalidFirstSectionType,
    InvalidSectionCount,
    InvalidMaxStackIncrease,
    InvalidStackHeight,
    InvalidDataloadnIndex,
    TruncatedInstruction,
    TooManyCodeSections,
    StackHeightMismatch,
    StackUnderflow,
    StackOverflow,
    MaxStackIncreaseAboveLimit,
    UnreachableCodeSections,
    UnreachableInstructions,
    InvalidContainerSectionIndex,
    EofcreateWithTruncatedContainer,
    ToplevelContainerTruncated,
}

/// One specific reason for a rejection, rendered `Category.REASON`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExceptionTag {
    Transaction(TransactionException),
    Block(BlockException),
    Eof(EOFException),
}

impl ExceptionTag {
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "TransactionException",
            Self::Block(_) => "BlockException",
            Self::Eof(_) => "EOFException",
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Transaction(e) => e.into(),
            Self::Block(e) => e.into(),
            Self::Eof(e) => e.into(),
        }
    }

    /// Whether the tag describes a malformed encoding, i.e. a failure a
    /// consumer may observe before the block is ever executed.
    pub fn is_decode_failure(&self) -> bool {
        self.reason().starts_with("RLP_")
            || matches!(self, Self::Block(BlockException::IncorrectBlockFormat))
    }
}

impl fmt::Display for ExceptionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category(), self.reason())
    }
}

impl FromStr for ExceptionTag {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let unknown = || FixtureError::UnknownException(s.to_string());
        let (category, reason) = s.split_once('.').ok_or_else(unknown)?;
        match category {
            "TransactionException" => TransactionException::from_str(reason)
                .map(Self::Transaction)
                .map_err(|_| unknown()),
            "BlockException" => BlockException::from_str(reason)
                .map(Self::Block)
                .map_err(|_| unknown()),
            "EOFException" => EOFException::from_str(reason)
                .map(Self::Eof)
                .map_err(|_| unknown()),
            _ => Err(unknown()),
        }
    }
}

impl Serialize for ExceptionTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExceptionTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// An expected-exception field: one or more acceptable tags, written
/// `A.X|B.Y` in fixtures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionSet(Vec<ExceptionTag>);

impl ExceptionSet {
    pub fn new(tags: Vec<ExceptionTag>) -> Self {
        Self(tags)
    }

    pub fn tags(&self) -> &[ExceptionTag] {
        &self.0
    }

    pub fn contains(&self, tag: &ExceptionTag) -> bool {
        self.0.contains(tag)
    }

    /// Whether a block that cannot be decoded satisfies this expectation.
    pub fn admits_decode_failure(&self) -> bool {
        self.0.iter().any(ExceptionTag::is_decode_failure)
    }
}

impl From<ExceptionTag> for ExceptionSet {
    fn from(tag: ExceptionTag) -> Self {
        Self(vec![tag])
    }
}

impl fmt::Display for ExceptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join("|"))
    }
}

impl FromStr for ExceptionSet {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tags = s
            .split('|')
            .filter(|part| !part.trim().is_empty())
            .map(ExceptionTag::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        if tags.is_empty() {
            return Err(FixtureError::UnknownException(s.to_string()));
        }
        Ok(Self(tags))
    }
}

impl Serialize for ExceptionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ExceptionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
