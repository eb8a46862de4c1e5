use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Timestamp at which transition forks switch to their target fork.
pub const TRANSITION_TIMESTAMP: u64 = 15_000;

/// The protocol rule-set a fixture runs under.
///
/// Transition forks (e.g. `ShanghaiToCancunAtTime15k`) change rules at
/// [`TRANSITION_TIMESTAMP`]. Feature queries on a transition fork describe its
/// target fork; use [`Fork::at`] to get the rules of a given block.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
pub enum Fork {
    Frontier,
    Homestead,
    #[strum(to_string = "EIP150", serialize = "TangerineWhistle")]
    #[serde(alias = "TangerineWhistle")]
    EIP150,
    #[strum(to_string = "EIP158", serialize = "SpuriousDragon")]
    #[serde(alias = "SpuriousDragon")]
    EIP158,
    Byzantium,
    Constantinople,
    #[strum(to_string = "ConstantinopleFix", serialize = "Petersburg")]
    #[serde(alias = "Petersburg")]
    ConstantinopleFix,
    Istanbul,
    Berlin,
    London,
    #[strum(to_string = "Paris", serialize = "Merge")]
    #[serde(alias = "Merge")]
    Paris,
    Shanghai,
    Cancun,
    Prague,
    Osaka,
    ParisToShanghaiAtTime15k,
    ShanghaiToCancunAtTime15k,
    CancunToPragueAtTime15k,
    PragueToOsakaAtTime15k,
}

impl Fork {
    /// Source and target of a transition fork.
    const fn transition(self) -> Option<(Self, Self)> {
        match self {
            Self::ParisToShanghaiAtTime15k => Some((Self::Paris, Self::Shanghai)),
            Self::ShanghaiToCancunAtTime15k => Some((Self::Shanghai, Self::Cancun)),
            Self::CancunToPragueAtTime15k => Some((Self::Cancun, Self::Prague)),
            Self::PragueToOsakaAtTime15k => Some((Self::Prague, Self::Osaka)),
            _ => None,
        }
    }

    /// Returns the fork whose rules apply to blocks past the transition.
    pub const fn resolved(self) -> Self {
        match self.transition() {
            Some((_, target)) => target,
            None => self,
        }
    }

    /// Returns the fork whose rules apply to a block with `timestamp`.
    pub const fn at(self, timestamp: u64) -> Self {
        match self.transition() {
            Some((source, _)) if timestamp < TRANSITION_TIMESTAMP => source,
            Some((_, target)) => target,
            None => self,
        }
    }

    pub fn is_post_merge(self) -> bool {
        self.resolved() >= Self::Paris
    }

    pub fn has_withdrawals(self) -> bool {
        self.resolved() >= Self::Shanghai
    }

    pub fn has_blobs(self) -> bool {
        self.resolved() >= Self::Cancun
    }

    pub fn has_parent_beacon_root(self) -> bool {
        self.resolved() >= Self::Cancun
    }

    pub fn has_requests(self) -> bool {
        self.resolved() >= Self::Prague
    }

    /// Returns the lowest `engine_newPayload` version that carries every field
    /// this fork mandates, or `None` for pre-merge forks.
    pub fn payload_version(self) -> Option<u8> {
        if !self.is_post_merge() {
            return None;
        }
        Some(if self.has_requests() {
            4
        } else if self.has_blobs() {
            3
        } else if self.has_withdrawals() {
            2
        } else {
            1
        })
    }

    /// Returns the `engine_forkchoiceUpdated` version to use under this fork.
    pub fn forkchoice_version(self) -> Option<u8> {
        if !self.is_post_merge() {
            return None;
        }
        Some(if self.has_parent_beacon_root() {
            3
        } else if self.has_withdrawals() {
            2
        } else {
            1
        })
    }
}
