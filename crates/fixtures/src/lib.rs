//! Typed model of Ethereum execution-layer blockchain fixtures.
//!
//! Covers the fixture JSON formats (direct, Engine API and grouped), block
//! RLP decoding, the exception taxonomy with its per-client mappers, state
//! comparison and pre-allocation groups.
pub mod account;
pub mod block;
pub mod compare;
pub mod error;
pub mod exceptions;
pub mod fixture;
pub mod fork;
pub mod header;
pub mod payload;
pub mod pre_alloc;

pub use account::{diff_alloc, normalize_alloc, Account, Alloc, AllocDiff, Storage};
pub use block::{decode_block, ChainHead, DecodedBlock, Withdrawal};
pub use compare::{compare_head, compare_state, reconstruct_from_diff, Mismatch, MismatchReport};
pub use error::FixtureError;
pub use exceptions::{
    matches, BlockException, Classification, EOFException, ExceptionMapper, ExceptionSet,
    ExceptionTag, MatchPolicy, TransactionException,
};
pub use fixture::{load_fixture_file, BlockchainFixture, ExpectedPost, FixtureBlock, FixtureFile};
pub use fork::{Fork, TRANSITION_TIMESTAMP};
pub use header::Header;
pub use payload::{EngineNewPayload, ExecutionPayload, VersionMismatch};
pub use pre_alloc::{
    group_fixtures, group_key, Environment, PreAllocGroup, PreAllocHash, PRE_ALLOC_DIR,
};
