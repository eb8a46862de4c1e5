// Inspired by https://github.com/paradigmxyz/reth/tree/main/testing/ef-tests

use std::path::{Path, PathBuf};

use alloy_primitives::U256;
use ef_fixtures::{BlockchainFixture, FixtureFile};

use super::{
    error::RunnerError,
    result::{CaseResult, Failure, FailureKind, Verdict},
};
use crate::{
    filter::Filter,
    utils::io::{deserialize_into, load_file},
};

/// A single named fixture and the file it was read from.
#[derive(Debug, Clone)]
pub struct FixtureCase {
    pub path: PathBuf,
    pub name: String,
    pub fixture: BlockchainFixture,
}

impl FixtureCase {
    pub fn chain_id(&self) -> U256 {
        self.fixture
            .config
            .as_ref()
            .map_or(U256::from(1), |config| config.chainid)
    }

    pub fn result(&self, result: Result<Verdict, RunnerError>) -> CaseResult {
        CaseResult::new(&self.path, &self.name, result)
    }
}

/// A container for the fixtures of one or more files.
#[derive(Debug, Default)]
pub struct Cases {
    /// The runnable fixtures.
    pub test_cases: Vec<FixtureCase>,
    /// Results for fixtures that were skipped or failed validation.
    pub settled: Vec<CaseResult>,
}

impl Cases {
    /// Loads every fixture of the file at `path`. A fixture failing validation
    /// settles as a construction failure without affecting its siblings.
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let content = load_file(path)?;
        let fixtures: FixtureFile = deserialize_into(&content, path)?;

        let mut cases = Self::default();
        for (name, fixture) in fixtures {
            match fixture.validate() {
                Ok(()) => cases.test_cases.push(FixtureCase {
                    path: path.to_path_buf(),
                    name,
                    fixture,
                }),
                Err(err) => cases.settled.push(CaseResult::new(
                    path,
                    &name,
                    Ok(Failure::new(FailureKind::FixtureConstruction)
                        .with_message(err.to_string())
                        .into()),
                )),
            }
        }
        Ok(cases)
    }

    /// Settles the fixtures matched by `filter` as skipped.
    pub fn apply_filter(&mut self, filter: &Filter) {
        let (skipped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.test_cases)
            .into_iter()
            .partition(|case| filter.is_skipped(&case.path, Some(&case.name)));
        self.test_cases = kept;
        self.settled.extend(
            skipped
                .into_iter()
                .map(|case| case.result(Err(RunnerError::Skipped))),
        );
    }

    pub fn extend(&mut self, other: Self) {
        self.test_cases.extend(other.test_cases);
        self.settled.extend(other.settled);
    }

    pub fn len(&self) -> usize {
        self.test_cases.len() + self.settled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
