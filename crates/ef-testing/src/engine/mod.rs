//! Drives a target through a blockchain fixture and judges every step.
pub mod engine_api;

pub use engine_api::consume_payloads;

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Bytes, B256};
use ef_fixtures::{
    compare_head, compare_state, decode_block, matches, reconstruct_from_diff, Alloc,
    BlockchainFixture, ChainHead, Classification, ExceptionMapper, ExceptionSet, ExceptionTag,
    ExpectedPost, Fork, MatchPolicy, MismatchReport,
};
use tracing::{debug, trace};

use crate::cancellation::{guarded, Cancellation, Guarded};
use crate::models::result::{Failure, FailureKind, Verdict};
use crate::traits::{BlockTarget, GenesisInfo};

/// Outcome of feeding a single block to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Accepted {
        hash: B256,
        number: u64,
        state_root: B256,
    },
    /// The target refused the block. `tag` is set when the target classified
    /// the rejection itself.
    Rejected {
        message: String,
        tag: Option<ExceptionTag>,
    },
    DecodeFailed {
        error: String,
    },
    TimedOut,
}

/// Everything the engines need besides the fixture and the target.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub mapper: Arc<ExceptionMapper>,
    pub client_id: String,
    pub policy: MatchPolicy,
    /// Deadline for a single target call.
    pub call_timeout: Duration,
    /// How long a payload may stay `SYNCING` or `ACCEPTED`.
    pub syncing_timeout: Duration,
    pub poll_interval: Duration,
    pub cancel: Cancellation,
}

impl RunContext {
    pub fn new(mapper: Arc<ExceptionMapper>, client_id: impl Into<String>) -> Self {
        Self {
            mapper,
            client_id: client_id.into(),
            policy: MatchPolicy::Strict,
            call_timeout: Duration::from_secs(60),
            syncing_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            cancel: Cancellation::new(),
        }
    }

    pub fn classify(&self, message: &str, fork: Fork) -> Classification {
        self.mapper.classify(message, &self.client_id, Some(fork))
    }

    /// Judges a rejection against the expectation of block `index`.
    pub(crate) fn judge_rejection(
        &self,
        index: usize,
        expected: Option<&ExceptionSet>,
        message: &str,
        classification: Classification,
    ) -> Result<(), Failure> {
        let Some(expected) = expected else {
            return Err(Failure::new(FailureKind::UnexpectedRejection)
                .at_block(index)
                .with_message(message)
                .with_classification(classification));
        };
        if matches(expected, &classification, self.policy) {
            debug!("block {index} rejected as expected ({classification:?})");
            return Ok(());
        }
        let kind = match classification {
            Classification::Unmapped => FailureKind::UnmappedException,
            Classification::Mapped(_) => FailureKind::WrongExceptionReason,
        };
        Err(Failure::new(kind)
            .at_block(index)
            .with_expected(Some(expected))
            .with_message(message)
            .with_classification(classification))
    }
}

/// Where the engine stands in a fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    GenesisVerified { head: ChainHead, state_root: B256 },
    Extending { head: ChainHead, state_root: B256, next_block: usize },
    Finished(Verdict),
}

/// Consumes a direct blockchain fixture block by block.
pub struct BlockchainEngine<'a, T> {
    fixture: &'a BlockchainFixture,
    pre: &'a Alloc,
    target: &'a mut T,
    ctx: &'a RunContext,
    state: EngineState,
    resume: Option<GenesisInfo>,
    genesis: Option<GenesisInfo>,
}

impl<'a, T: BlockTarget> BlockchainEngine<'a, T> {
    /// `pre` is the fixture's own pre-state, or the group's for grouped
    /// fixtures.
    pub fn new(
        fixture: &'a BlockchainFixture,
        pre: &'a Alloc,
        target: &'a mut T,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            fixture,
            pre,
            target,
            ctx,
            state: EngineState::Uninitialized,
            resume: None,
            genesis: None,
        }
    }

    /// Starts from a genesis the target already holds: the target is moved
    /// back to it instead of being initialized again.
    pub fn resuming(mut self, genesis: GenesisInfo) -> Self {
        self.resume = Some(genesis);
        self
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// The genesis the target reported, once it matched the fixture.
    pub fn genesis(&self) -> Option<GenesisInfo> {
        self.genesis
    }

    /// Runs the fixture to completion. The engine is left `Finished`.
    pub async fn run(&mut self) -> Verdict {
        let verdict = Verdict::from(self.consume().await);
        self.state = EngineState::Finished(verdict.clone());
        verdict
    }

    async fn consume(&mut self) -> Result<(), Failure> {
        let (mut head, mut state_root) = self.init_genesis().await?;
        self.state = EngineState::GenesisVerified { head, state_root };

        let fixture = self.fixture;
        for (index, block) in fixture.blocks.iter().enumerate() {
            self.state = EngineState::Extending {
                head,
                state_root,
                next_block: index,
            };
            if self.ctx.cancel.is_cancelled() {
                return Err(Failure::new(FailureKind::Cancelled).at_block(index));
            }

            let expected = block.expect_exception.as_ref();
            let (outcome, fork) = self.feed(index, block.rlp_bytes().map_err(|e| e.to_string())).await?;
            match outcome {
                BlockOutcome::Accepted {
                    hash,
                    number,
                    state_root: root,
                } => {
                    if let Some(expected) = expected {
                        return Err(Failure::new(FailureKind::UnexpectedAcceptance)
                            .at_block(index)
                            .with_expected(Some(expected)));
                    }
                    trace!("block {index} accepted as #{number} {hash}");
                    head = ChainHead { hash, number };
                    state_root = root;
                }
                BlockOutcome::Rejected { message, tag } => {
                    let classification = tag.map_or_else(
                        || self.ctx.classify(&message, fork),
                        Classification::Mapped,
                    );
                    self.ctx
                        .judge_rejection(index, expected, &message, classification)?;
                    break;
                }
                BlockOutcome::DecodeFailed { error } => match expected {
                    Some(expected) if self.ctx.policy.admits_decode_failure(expected) => {
                        debug!("block {index} failed to decode as expected: {error}");
                        break;
                    }
                    _ => {
                        return Err(Failure::new(FailureKind::DecodeError {
                            expected: expected.cloned(),
                        })
                        .at_block(index)
                        .with_message(error))
                    }
                },
                BlockOutcome::TimedOut => {
                    return Err(Failure::new(FailureKind::Timeout).at_block(index));
                }
            }
        }

        self.check_head(head)?;
        self.check_state(state_root).await
    }

    async fn init_genesis(&mut self) -> Result<(ChainHead, B256), Failure> {
        let fixture = self.fixture;
        let pre = self.pre;
        let genesis = &fixture.genesis_block_header;
        let setup = |message: String| Failure::new(FailureKind::SetupError).with_message(message);
        let resume = self.resume;
        let target = &mut *self.target;
        let call = async move {
            match resume {
                Some(info) => target.reset_to(info.hash).await.map(|()| info),
                None => target.init_genesis(fixture.network, pre, genesis).await,
            }
        };
        let info = match guarded(call, self.ctx.call_timeout, &self.ctx.cancel).await {
            Guarded::Done(Ok(info)) => info,
            Guarded::Done(Err(err)) => return Err(setup(err.to_string())),
            Guarded::TimedOut => return Err(Failure::new(FailureKind::Timeout)),
            Guarded::Cancelled => return Err(Failure::new(FailureKind::Cancelled)),
        };
        if info.state_root != genesis.state_root {
            return Err(setup(format!(
                "genesis state root mismatch: expected {}, got {}",
                genesis.state_root, info.state_root
            )));
        }
        let expected_hash = self.fixture.genesis_hash();
        if info.hash != expected_hash {
            return Err(setup(format!(
                "genesis hash mismatch: expected {expected_hash}, got {}",
                info.hash
            )));
        }
        self.genesis = Some(info);
        Ok((self.fixture.genesis_head(), info.state_root))
    }

    /// Decodes and applies block `index`. Also returns the fork active for
    /// the block, which is the fixture network when the block does not decode.
    async fn feed(
        &mut self,
        index: usize,
        raw: Result<Bytes, String>,
    ) -> Result<(BlockOutcome, Fork), Failure> {
        let network = self.fixture.network;
        let raw = match raw {
            Ok(raw) => raw,
            Err(error) => return Ok((BlockOutcome::DecodeFailed { error }, network)),
        };
        let decoded = match decode_block(&raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                let error = err.to_string();
                return Ok((BlockOutcome::DecodeFailed { error }, network));
            }
        };
        let fork = network.at(decoded.header.timestamp.saturating_to());
        let outcome = match guarded(
            self.target.apply_block(&decoded, &raw),
            self.ctx.call_timeout,
            &self.ctx.cancel,
        )
        .await
        {
            Guarded::Done(Ok(outcome)) => outcome,
            Guarded::Done(Err(err)) => {
                return Err(Failure::new(FailureKind::ClientFault)
                    .at_block(index)
                    .with_message(err.to_string()))
            }
            Guarded::TimedOut => BlockOutcome::TimedOut,
            Guarded::Cancelled => return Err(Failure::new(FailureKind::Cancelled).at_block(index)),
        };
        Ok((outcome, fork))
    }

    fn check_head(&self, observed: ChainHead) -> Result<(), Failure> {
        compare_head(&self.fixture.expected_head(), &observed)
            .map_err(|err| Failure::new(FailureKind::HeadMismatch).with_message(err.to_string()))
    }

    async fn check_state(&mut self, state_root: B256) -> Result<(), Failure> {
        let expected_post = self.fixture.expected_post().map_err(|err| {
            Failure::new(FailureKind::FixtureConstruction).with_message(err.to_string())
        })?;
        let expected = match expected_post {
            ExpectedPost::Full(alloc) => alloc.clone(),
            ExpectedPost::Diff(diff) => reconstruct_from_diff(self.pre, diff),
            ExpectedPost::Root(root) => {
                if root == state_root {
                    return Ok(());
                }
                return Err(Failure::new(FailureKind::StateMismatch).with_message(format!(
                    "post state root expected {root}, got {state_root}"
                )));
            }
        };
        let observed = match guarded(
            self.target.state_alloc(&expected),
            self.ctx.call_timeout,
            &self.ctx.cancel,
        )
        .await
        {
            Guarded::Done(Ok(observed)) => observed,
            Guarded::Done(Err(err)) => {
                return Err(Failure::new(FailureKind::ClientFault).with_message(err.to_string()))
            }
            Guarded::TimedOut => return Err(Failure::new(FailureKind::Timeout)),
            Guarded::Cancelled => return Err(Failure::new(FailureKind::Cancelled)),
        };
        state_verdict(&expected, &observed)
    }
}

/// Consumes a direct blockchain fixture from genesis to its final state.
pub async fn consume_blocks<T: BlockTarget>(
    fixture: &BlockchainFixture,
    pre: &Alloc,
    target: &mut T,
    ctx: &RunContext,
) -> Verdict {
    BlockchainEngine::new(fixture, pre, target, ctx).run().await
}

/// Turns a state comparison into a failure when anything differs.
pub(crate) fn state_verdict(expected: &Alloc, observed: &Alloc) -> Result<(), Failure> {
    let report: MismatchReport = compare_state(expected, observed);
    if report.is_empty() {
        return Ok(());
    }
    Err(Failure::new(FailureKind::StateMismatch)
        .with_message(format!("{} mismatches", report.len()))
        .with_mismatches(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::test_utils::{self, FakeBlockTarget};
    use alloy_primitives::{Address, U256};
    use ef_fixtures::{BlockException, Mismatch, TransactionException};
    use rstest::rstest;

    fn ctx() -> RunContext {
        RunContext::new(Arc::new(ExceptionMapper::bundled().unwrap()), "geth")
    }

    #[tokio::test]
    async fn test_empty_fixture_passes() {
        // Given
        let fixture = test_utils::fixture(0, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_valid_chain_passes_and_is_idempotent() {
        // Given
        let fixture = test_utils::fixture(2, None);
        let pre = fixture.pre.clone().unwrap();
        let ctx = ctx();

        // When
        let mut first_target = FakeBlockTarget::default();
        let first = BlockchainEngine::new(&fixture, &pre, &mut first_target, &ctx).run().await;
        let mut second_target = FakeBlockTarget::default();
        let second = BlockchainEngine::new(&fixture, &pre, &mut second_target, &ctx).run().await;

        // Then
        assert_eq!(first, Verdict::Pass);
        assert_eq!(first, second);
        assert_eq!(first_target.applied, 2);
    }

    #[tokio::test]
    async fn test_expected_rejection_passes_and_stops() {
        // Given
        let fixture = test_utils::fixture(
            2,
            Some("TransactionException.INSUFFICIENT_ACCOUNT_FUNDS|TransactionException.INTRINSIC_GAS_TOO_LOW"),
        );
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::rejecting("intrinsic gas too low: have 0, want 21000");
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(target.applied, 2);
    }

    #[tokio::test]
    async fn test_unmapped_rejection_fails_in_strict_mode() {
        // Given
        let fixture = test_utils::fixture(1, Some("TransactionException.INTRINSIC_GAS_TOO_LOW"));
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::rejecting("weird client message");
        let mut ctx = ctx();

        // When
        let strict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;
        ctx.policy = MatchPolicy::Relaxed {
            accept_decode_failure: false,
        };
        let mut target = FakeBlockTarget::rejecting("weird client message");
        let relaxed = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(
            strict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::UnmappedException)
        );
        assert_eq!(relaxed, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_wrong_reason() {
        // Given
        let fixture = test_utils::fixture(1, Some("BlockException.INVALID_GAS_USED"));
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::rejecting("invalid merkle root (remote: 0x01 local: 0x02)");
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::WrongExceptionReason);
        assert_eq!(failure.block, Some(0));
        assert_eq!(
            failure.classification,
            Some(Classification::Mapped(ExceptionTag::Block(
                BlockException::InvalidStateRoot
            )))
        );
    }

    #[tokio::test]
    async fn test_unexpected_acceptance() {
        // Given
        let fixture = test_utils::fixture(1, Some("TransactionException.NONCE_MISMATCH_TOO_LOW"));
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::UnexpectedAcceptance)
        );
    }

    #[tokio::test]
    async fn test_target_classified_rejection() {
        // Given
        let fixture = test_utils::fixture(1, Some("TransactionException.NONCE_MISMATCH_TOO_LOW"));
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::rejecting_with_tag(ExceptionTag::Transaction(
            TransactionException::NonceMismatchTooLow,
        ));
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_decode_failure() {
        // Given
        let mut decodable = test_utils::fixture(1, Some("BlockException.RLP_STRUCTURES_ENCODING"));
        decodable.blocks[0].rlp = "0xf90100".into();
        let mut not_decodable = decodable.clone();
        not_decodable.blocks[0].expect_exception =
            Some("TransactionException.INTRINSIC_GAS_TOO_LOW".parse().unwrap());
        let pre = decodable.pre.clone().unwrap();
        let ctx = ctx();

        // When
        let mut target = FakeBlockTarget::default();
        let admitted = BlockchainEngine::new(&decodable, &pre, &mut target, &ctx).run().await;
        let mut target = FakeBlockTarget::default();
        let refused = BlockchainEngine::new(&not_decodable, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(admitted, Verdict::Pass);
        assert!(matches!(
            refused.failure().map(|f| &f.kind),
            Some(FailureKind::DecodeError { expected: Some(_) })
        ));
        assert_eq!(target.applied, 0);
    }

    #[tokio::test]
    async fn test_genesis_mismatch_is_setup_error() {
        // Given
        let mut fixture = test_utils::fixture(1, None);
        fixture.genesis_block_header.state_root = B256::repeat_byte(0xff);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::SetupError)
        );
        assert_eq!(target.applied, 0);
    }

    #[tokio::test]
    async fn test_state_mismatch_reports_everything() {
        // Given
        let mut fixture = test_utils::fixture(1, None);
        let post = fixture.post_state.as_mut().unwrap();
        for account in post.values_mut() {
            account.nonce += alloy_primitives::U256::from(5);
        }
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::StateMismatch);
        assert_eq!(
            failure.mismatches.as_ref().map(MismatchReport::len),
            Some(pre.len())
        );
    }

    #[tokio::test]
    async fn test_head_mismatch() {
        // Given
        let mut fixture = test_utils::fixture(1, None);
        fixture.lastblockhash = B256::repeat_byte(0xab);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::HeadMismatch)
        );
    }

    #[tokio::test]
    async fn test_timeout_is_not_a_rejection() {
        // Given
        let fixture = test_utils::fixture(1, Some("TransactionException.INTRINSIC_GAS_TOO_LOW"));
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::with_delay(Duration::from_secs(5));
        let mut ctx = ctx();
        ctx.call_timeout = Duration::from_millis(20);

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::Timeout)
        );
    }

    /// A one block fixture whose block credits the sender with 100 wei,
    /// and the target changes that block applies.
    fn crediting_fixture(posted_credit: u64) -> (BlockchainFixture, HashMap<B256, Alloc>) {
        let mut fixture = test_utils::fixture(1, None);
        let sender = Address::repeat_byte(0xa9);
        let block_hash = fixture.blocks[0]
            .block_header
            .as_ref()
            .and_then(|header| header.hash)
            .unwrap();
        let mut credited = fixture.pre.as_ref().unwrap()[&sender].clone();
        credited.balance += U256::from(100);
        let changes = [(block_hash, [(sender, credited)].into_iter().collect())]
            .into_iter()
            .collect();
        let post = fixture.post_state.as_mut().unwrap();
        post.get_mut(&sender).unwrap().balance += U256::from(posted_credit);
        (fixture, changes)
    }

    #[tokio::test]
    async fn test_block_state_changes_are_checked() {
        // Given
        let (fixture, changes) = crediting_fixture(100);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::with_changes(changes);
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_balance_off_by_one_is_reported() {
        // Given
        let (fixture, changes) = crediting_fixture(99);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::with_changes(changes);
        let ctx = ctx();
        let sender = Address::repeat_byte(0xa9);
        let balance = pre[&sender].balance;

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::StateMismatch);
        assert_eq!(
            failure.mismatches.as_ref().unwrap().mismatches(),
            &[Mismatch::Balance {
                address: sender,
                expected: balance + U256::from(99),
                observed: balance + U256::from(100),
            }]
        );
    }

    #[rstest]
    #[case::passing(0, Verdict::Pass)]
    #[case::failing(1, Verdict::from(Failure::new(FailureKind::HeadMismatch)))]
    #[tokio::test]
    async fn test_run_leaves_engine_finished(#[case] skew: u8, #[case] expected: Verdict) {
        // Given
        let mut fixture = test_utils::fixture(1, None);
        if skew > 0 {
            fixture.lastblockhash = B256::repeat_byte(skew);
        }
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();
        let mut engine = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx);
        assert_eq!(engine.state(), &EngineState::Uninitialized);

        // When
        let verdict = engine.run().await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| &f.kind),
            expected.failure().map(|f| &f.kind)
        );
        assert_eq!(engine.state(), &EngineState::Finished(verdict));
    }

    #[tokio::test]
    async fn test_import_fault_names_the_block() {
        // Given
        let fixture = test_utils::fixture(2, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::faulting("tool crashed");
        let ctx = ctx();

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx).run().await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::ClientFault);
        assert_eq!(failure.block, Some(0));
        assert_eq!(target.applied, 1);
    }

    #[tokio::test]
    async fn test_resuming_rolls_back_to_genesis() {
        // Given
        let (fixture, changes) = crediting_fixture(100);
        let untouched = test_utils::fixture(0, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::with_changes(changes);
        let ctx = ctx();
        let genesis = {
            let mut first = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx);
            assert_eq!(first.run().await, Verdict::Pass);
            first.genesis().unwrap()
        };

        // When
        let verdict = BlockchainEngine::new(&untouched, &pre, &mut target, &ctx)
            .resuming(genesis)
            .run()
            .await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(target.inits, 1);
    }

    #[tokio::test]
    async fn test_resuming_unknown_genesis_is_setup_error() {
        // Given
        let fixture = test_utils::fixture(1, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();
        let genesis = GenesisInfo {
            state_root: test_utils::STATE_ROOT,
            hash: fixture.genesis_hash(),
        };

        // When
        let verdict = BlockchainEngine::new(&fixture, &pre, &mut target, &ctx)
            .resuming(genesis)
            .run()
            .await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::SetupError)
        );
        assert_eq!(target.inits, 0);
    }
}
