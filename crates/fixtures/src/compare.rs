use std::collections::BTreeSet;
use std::fmt;

use alloy_primitives::{Address, Bytes, U256};

use crate::account::{Account, Alloc, AllocDiff};
use crate::block::ChainHead;

/// A single difference between an expected and an observed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Balance {
        address: Address,
        expected: U256,
        observed: U256,
    },
    Nonce {
        address: Address,
        expected: U256,
        observed: U256,
    },
    Code {
        address: Address,
        expected: Bytes,
        observed: Bytes,
    },
    Storage {
        address: Address,
        key: U256,
        expected: U256,
        observed: U256,
    },
    MissingAccount {
        address: Address,
    },
    UnexpectedAccount {
        address: Address,
    },
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Balance {
                address,
                expected,
                observed,
            } => write!(f, "{address}: balance expected {expected}, got {observed}"),
            Self::Nonce {
                address,
                expected,
                observed,
            } => write!(f, "{address}: nonce expected {expected}, got {observed}"),
            Self::Code {
                address,
                expected,
                observed,
            } => write!(f, "{address}: code expected {expected}, got {observed}"),
            Self::Storage {
                address,
                key,
                expected,
                observed,
            } => write!(
                f,
                "{address}: storage[{key:#x}] expected {expected:#x}, got {observed:#x}"
            ),
            Self::MissingAccount { address } => write!(f, "{address}: account missing"),
            Self::UnexpectedAccount { address } => write!(f, "{address}: unexpected account"),
        }
    }
}

/// Every mismatch found while comparing two states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MismatchReport(Vec<Mismatch>);

impl MismatchReport {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn mismatches(&self) -> &[Mismatch] {
        &self.0
    }

    pub fn push(&mut self, mismatch: Mismatch) {
        self.0.push(mismatch);
    }
}

impl fmt::Display for MismatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, mismatch) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{mismatch}")?;
        }
        Ok(())
    }
}

/// Compares two states account by account and collects every difference.
/// A zero-valued storage slot is equivalent to an absent one.
pub fn compare_state(expected: &Alloc, observed: &Alloc) -> MismatchReport {
    let mut report = MismatchReport::default();
    let addresses: BTreeSet<&Address> = expected.keys().chain(observed.keys()).collect();
    for address in addresses {
        match (expected.get(address), observed.get(address)) {
            (Some(expected), Some(observed)) => {
                compare_account(*address, expected, observed, &mut report);
            }
            (Some(_), None) => report.push(Mismatch::MissingAccount { address: *address }),
            (None, Some(_)) => report.push(Mismatch::UnexpectedAccount { address: *address }),
            (None, None) => {}
        }
    }
    report
}

fn compare_account(address: Address, expected: &Account, observed: &Account, report: &mut MismatchReport) {
    if expected.balance != observed.balance {
        report.push(Mismatch::Balance {
            address,
            expected: expected.balance,
            observed: observed.balance,
        });
    }
    if expected.nonce != observed.nonce {
        report.push(Mismatch::Nonce {
            address,
            expected: expected.nonce,
            observed: observed.nonce,
        });
    }
    if expected.code != observed.code {
        report.push(Mismatch::Code {
            address,
            expected: expected.code.clone(),
            observed: observed.code.clone(),
        });
    }
    let keys: BTreeSet<&U256> = expected.storage.keys().chain(observed.storage.keys()).collect();
    for key in keys {
        let (want, got) = (expected.storage_at(key), observed.storage_at(key));
        if want != got {
            report.push(Mismatch::Storage {
                address,
                key: *key,
                expected: want,
                observed: got,
            });
        }
    }
}

/// Applies a diff to a base state. The base is left untouched.
pub fn reconstruct_from_diff(base: &Alloc, diff: &AllocDiff) -> Alloc {
    let mut alloc = base.clone();
    for (address, change) in diff {
        match change {
            Some(account) => {
                alloc.insert(*address, account.clone());
            }
            None => {
                alloc.remove(address);
            }
        }
    }
    alloc
}

/// The chain ended on a different head than expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("head mismatch: expected {expected}, got {observed}")]
pub struct HeadMismatch {
    pub expected: ChainHead,
    pub observed: ChainHead,
}

/// Heads must match exactly.
pub fn compare_head(expected: &ChainHead, observed: &ChainHead) -> Result<(), HeadMismatch> {
    if expected == observed {
        Ok(())
    } else {
        Err(HeadMismatch {
            expected: *expected,
            observed: *observed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::diff_alloc;
    use alloy_primitives::{address, B256};

    const SENDER: Address = address!("a94f5374fce5edbc8e2a8697c15331677e6ebf0b");
    const CONTRACT: Address = address!("0000000000000000000000000000000000001000");

    fn base() -> Alloc {
        let mut contract = Account {
            code: Bytes::from_static(&[0x60, 0x00, 0x55]),
            ..Default::default()
        };
        contract.storage.insert(U256::from(1), U256::from(2));
        [
            (
                SENDER,
                Account {
                    balance: U256::from(1_000_000),
                    ..Default::default()
                },
            ),
            (CONTRACT, contract),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_compare_identical() {
        assert!(compare_state(&base(), &base()).is_empty());
    }

    #[test]
    fn test_zero_storage_equals_absent() {
        // Given
        let mut with_zero = base();
        with_zero
            .get_mut(&CONTRACT)
            .unwrap()
            .storage
            .insert(U256::from(7), U256::ZERO);

        // Then
        assert!(compare_state(&with_zero, &base()).is_empty());
        assert!(compare_state(&base(), &with_zero).is_empty());
    }

    #[test]
    fn test_all_mismatches_collected() {
        // Given
        let expected = base();
        let mut observed = base();
        let sender = observed.get_mut(&SENDER).unwrap();
        sender.balance = U256::from(1);
        sender.nonce = U256::from(1);
        observed
            .get_mut(&CONTRACT)
            .unwrap()
            .storage
            .insert(U256::from(1), U256::from(3));
        observed.insert(Address::repeat_byte(0xee), Account::default());

        // When
        let report = compare_state(&expected, &observed);

        // Then
        assert_eq!(report.len(), 4);
        assert!(report.mismatches().contains(&Mismatch::Storage {
            address: CONTRACT,
            key: U256::from(1),
            expected: U256::from(2),
            observed: U256::from(3),
        }));
        assert!(report.mismatches().contains(&Mismatch::UnexpectedAccount {
            address: Address::repeat_byte(0xee)
        }));
        assert_eq!(report.to_string().lines().count(), 4);
    }

    #[test]
    fn test_missing_account() {
        // Given
        let mut observed = base();
        observed.remove(&CONTRACT);

        // When
        let report = compare_state(&base(), &observed);

        // Then
        assert_eq!(
            report.mismatches(),
            &[Mismatch::MissingAccount { address: CONTRACT }]
        );
    }

    #[test]
    fn test_reconstruct_matches_full_state() {
        // Given
        let pre = base();
        let mut post = base();
        post.remove(&CONTRACT);
        post.get_mut(&SENDER).unwrap().nonce = U256::from(1);
        post.insert(Address::repeat_byte(0x01), Account::default());
        let diff = diff_alloc(&pre, &post);

        // When
        let reconstructed = reconstruct_from_diff(&pre, &diff);

        // Then
        assert!(compare_state(&post, &reconstructed).is_empty());
        assert_eq!(pre, base());
    }

    #[test]
    fn test_compare_head() {
        // Given
        let expected = ChainHead {
            hash: B256::repeat_byte(1),
            number: 2,
        };
        let observed = ChainHead {
            hash: B256::repeat_byte(1),
            number: 1,
        };

        // Then
        assert!(compare_head(&expected, &expected).is_ok());
        assert_eq!(
            compare_head(&expected, &observed),
            Err(HeadMismatch { expected, observed })
        );
    }
}
