use std::collections::BTreeMap;

use alloy_primitives::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// Account storage. Zero-valued slots are equivalent to absent ones.
pub type Storage = BTreeMap<U256, U256>;

/// A full account-state snapshot.
pub type Alloc = BTreeMap<Address, Account>;

/// A sparse set of changes relative to a base [`Alloc`].
/// `Some(account)` is a modified or new account, `None` a deleted one.
pub type AllocDiff = BTreeMap<Address, Option<Account>>;

/// An account in a fixture pre- or post-state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub balance: U256,
    #[serde(default)]
    pub code: Bytes,
    #[serde(default)]
    pub nonce: U256,
    #[serde(default)]
    pub storage: Storage,
}

impl Account {
    /// Returns the value at `key`, zero if the slot is absent.
    pub fn storage_at(&self, key: &U256) -> U256 {
        self.storage.get(key).copied().unwrap_or_default()
    }

    /// Returns a copy of the account without zero-valued storage slots.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            storage: self
                .storage
                .iter()
                .filter(|(_, v)| !v.is_zero())
                .map(|(k, v)| (*k, *v))
                .collect(),
            ..self.clone()
        }
    }

    /// An account is empty when it has no balance, no nonce, no code and no
    /// non-zero storage.
    pub fn is_empty(&self) -> bool {
        self.balance.is_zero()
            && self.nonce.is_zero()
            && self.code.is_empty()
            && self.storage.values().all(U256::is_zero)
    }
}

/// Returns a copy of the alloc with every account normalized.
pub fn normalize_alloc(alloc: &Alloc) -> Alloc {
    alloc
        .iter()
        .map(|(address, account)| (*address, account.normalized()))
        .collect()
}

/// Computes the diff that turns `base` into `target`.
pub fn diff_alloc(base: &Alloc, target: &Alloc) -> AllocDiff {
    let mut diff = AllocDiff::new();
    for (address, account) in target {
        let changed = base
            .get(address)
            .map(|previous| previous.normalized() != account.normalized())
            .unwrap_or(true);
        if changed {
            diff.insert(*address, Some(account.clone()));
        }
    }
    for address in base.keys() {
        if !target.contains_key(address) {
            diff.insert(*address, None);
        }
    }
    diff
}
