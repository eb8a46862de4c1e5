//! Consumption of Engine-API fixtures: every payload goes through
//! `engine_newPayload`, accepted ones are made canonical with
//! `engine_forkchoiceUpdated`.
use std::future::Future;

use ef_fixtures::{
    compare_head, reconstruct_from_diff, Alloc, BlockchainFixture, EngineNewPayload, ExpectedPost,
};
use tracing::{debug, trace, warn};

use super::{state_verdict, RunContext};
use crate::cancellation::{guarded, Guarded};
use crate::models::error::RunnerError;
use crate::models::result::{Failure, FailureKind, Verdict};
use crate::targets::rpc::{BlockTag, ForkchoiceState, PayloadStatus, PayloadStatusKind};
use crate::traits::{read_state, state_hint, EngineTarget};

/// Runs every payload of `fixture` against a client whose genesis was built
/// from `pre`.
pub async fn consume_payloads<T: EngineTarget>(
    fixture: &BlockchainFixture,
    pre: &Alloc,
    target: &mut T,
    ctx: &RunContext,
) -> Verdict {
    Verdict::from(consume(fixture, pre, target, ctx).await)
}

async fn consume<T: EngineTarget>(
    fixture: &BlockchainFixture,
    pre: &Alloc,
    target: &mut T,
    ctx: &RunContext,
) -> Result<(), Failure> {
    check_genesis(fixture, target, ctx).await?;

    for (index, payload) in fixture.engine_new_payloads.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(Failure::new(FailureKind::Cancelled).at_block(index));
        }
        payload.check_version(fixture.network).map_err(|err| {
            Failure::new(FailureKind::FixtureConstruction)
                .at_block(index)
                .with_message(err.to_string())
        })?;
        trace!(
            "payload {index}: engine_newPayloadV{} #{} {}",
            payload.version,
            payload.execution_payload.number(),
            payload.block_hash()
        );

        let status = match submit(index, payload, target, ctx).await? {
            Submitted::Status(status) => status,
            Submitted::RpcError { code, message } => {
                if payload.error_code == Some(code) {
                    debug!("payload {index} refused with expected error {code}");
                    break;
                }
                return Err(Failure::new(FailureKind::ProtocolErrorMismatch)
                    .at_block(index)
                    .with_message(format!(
                        "expected {}, got JSON-RPC error {code}: {message}",
                        describe_error_code(payload.error_code)
                    )));
            }
        };

        if let Some(code) = payload.error_code {
            return Err(Failure::new(FailureKind::ProtocolErrorMismatch)
                .at_block(index)
                .with_message(format!(
                    "expected JSON-RPC error {code}, got status {:?}",
                    status.status
                )));
        }

        if status.status.is_invalid() {
            let message = status.validation_error.unwrap_or_default();
            let classification = ctx.classify(&message, payload.fork(fixture.network));
            ctx.judge_rejection(index, payload.validation_error.as_ref(), &message, classification)?;
            break;
        }

        if let Some(expected) = &payload.validation_error {
            return Err(Failure::new(FailureKind::UnexpectedAcceptance)
                .at_block(index)
                .with_expected(Some(expected)));
        }

        let version = fixture.forkchoice_version(payload).ok_or_else(|| {
            Failure::new(FailureKind::FixtureConstruction)
                .at_block(index)
                .with_message(format!("no forkchoiceUpdated version for {}", fixture.network))
        })?;
        let state = ForkchoiceState::head(payload.block_hash());
        let fcu = call(Some(index), target.forkchoice_updated(version, state), ctx)
            .await?
            .map_err(|err| client_fault(Some(index), err))?;
        if fcu.status != PayloadStatusKind::Valid {
            return Err(Failure::new(FailureKind::UnexpectedRejection)
                .at_block(index)
                .with_message(format!(
                    "engine_forkchoiceUpdatedV{version} returned {:?}{}",
                    fcu.status,
                    fcu.validation_error.map(|e| format!(": {e}")).unwrap_or_default()
                )));
        }
    }

    let observed = call(None, target.head(), ctx)
        .await?
        .map_err(|err| client_fault(None, err))?;
    compare_head(&fixture.expected_head(), &observed)
        .map_err(|err| Failure::new(FailureKind::HeadMismatch).with_message(err.to_string()))?;

    check_state(fixture, pre, target, ctx).await
}

enum Submitted {
    Status(PayloadStatus),
    RpcError { code: i64, message: String },
}

/// Submits a payload, re-submitting it while the client reports it is still
/// syncing.
async fn submit<T: EngineTarget>(
    index: usize,
    payload: &EngineNewPayload,
    target: &mut T,
    ctx: &RunContext,
) -> Result<Submitted, Failure> {
    let deadline = tokio::time::Instant::now() + ctx.syncing_timeout;
    loop {
        let response = call(Some(index), target.new_payload(payload.version, payload), ctx).await?;
        let status = match response {
            Ok(status) => status,
            Err(RunnerError::Rpc { code, message }) => {
                return Ok(Submitted::RpcError { code, message })
            }
            Err(err) => return Err(client_fault(Some(index), err)),
        };
        if !status.status.is_pending() {
            return Ok(Submitted::Status(status));
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("payload {index} still {:?} after {:?}", status.status, ctx.syncing_timeout);
            return Err(Failure::new(FailureKind::Timeout)
                .at_block(index)
                .with_message(format!("payload stayed {:?}", status.status)));
        }
        tokio::time::sleep(ctx.poll_interval).await;
    }
}

async fn check_genesis<T: EngineTarget>(
    fixture: &BlockchainFixture,
    target: &mut T,
    ctx: &RunContext,
) -> Result<(), Failure> {
    let genesis = fixture.genesis_head();
    let observed = call(None, target.block_hash(genesis.number), ctx)
        .await?
        .map_err(|err| {
            Failure::new(FailureKind::SetupError).with_message(err.to_string())
        })?;
    match observed {
        Some(hash) if hash == genesis.hash => Ok(()),
        Some(hash) => Err(Failure::new(FailureKind::SetupError).with_message(format!(
            "genesis hash mismatch: expected {}, got {hash}",
            genesis.hash
        ))),
        None => Err(Failure::new(FailureKind::SetupError)
            .with_message(format!("client has no block #{}", genesis.number))),
    }
}

async fn check_state<T: EngineTarget>(
    fixture: &BlockchainFixture,
    pre: &Alloc,
    target: &mut T,
    ctx: &RunContext,
) -> Result<(), Failure> {
    let expected_post = fixture.expected_post().map_err(|err| {
        Failure::new(FailureKind::FixtureConstruction).with_message(err.to_string())
    })?;
    let expected = match expected_post {
        ExpectedPost::Full(alloc) => alloc.clone(),
        ExpectedPost::Diff(diff) => reconstruct_from_diff(pre, diff),
        ExpectedPost::Root(root) => {
            let head = call(None, target.block(BlockTag::Latest), ctx)
                .await?
                .map_err(|err| client_fault(None, err))?
                .ok_or_else(|| {
                    Failure::new(FailureKind::ClientFault).with_message("client has no latest block")
                })?;
            if head.state_root == root {
                return Ok(());
            }
            return Err(Failure::new(FailureKind::StateMismatch).with_message(format!(
                "post state root expected {root}, got {}",
                head.state_root
            )));
        }
    };
    let hint = state_hint(pre, &expected);
    let observed = call(None, read_state(target, &hint), ctx)
        .await?
        .map_err(|err| client_fault(None, err))?;
    state_verdict(&expected, &observed)
}

/// Races a client call against the per-call deadline and cancellation.
async fn call<T, F>(
    index: Option<usize>,
    fut: F,
    ctx: &RunContext,
) -> Result<Result<T, RunnerError>, Failure>
where
    F: Future<Output = Result<T, RunnerError>>,
{
    let failure = |kind| match index {
        Some(index) => Failure::new(kind).at_block(index),
        None => Failure::new(kind),
    };
    match guarded(fut, ctx.call_timeout, &ctx.cancel).await {
        Guarded::Done(result) => Ok(result),
        Guarded::TimedOut => Err(failure(FailureKind::Timeout)),
        Guarded::Cancelled => Err(failure(FailureKind::Cancelled)),
    }
}

fn client_fault(index: Option<usize>, err: RunnerError) -> Failure {
    let failure = Failure::new(FailureKind::ClientFault).with_message(err.to_string());
    match index {
        Some(index) => failure.at_block(index),
        None => failure,
    }
}

fn describe_error_code(code: Option<i64>) -> String {
    code.map_or_else(|| "a payload status".to_string(), |code| format!("error {code}"))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::test_utils::{self, FakeEngineTarget};
    use alloy_primitives::{Address, U256};
    use ef_fixtures::{ExceptionMapper, Mismatch};

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(Arc::new(ExceptionMapper::bundled().unwrap()), "geth");
        ctx.poll_interval = Duration::from_millis(5);
        ctx.syncing_timeout = Duration::from_millis(200);
        ctx
    }

    #[tokio::test]
    async fn test_valid_payloads_pass() {
        // Given
        let fixture = test_utils::engine_fixture(3, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(target.head.number, 3);
    }

    #[tokio::test]
    async fn test_invalid_payload_does_not_move_head() {
        // Given
        let fixture = test_utils::engine_fixture(
            2,
            Some((1, "TransactionException.INTRINSIC_GAS_TOO_LOW")),
        );
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.invalid.insert(
            fixture.engine_new_payloads[1].block_hash(),
            "intrinsic gas too low: have 0, want 21000".into(),
        );

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(target.head.number, 1);
        assert_eq!(target.new_payload_calls, 2);
    }

    #[tokio::test]
    async fn test_stops_at_first_invalid_payload() {
        // Given
        let mut fixture = test_utils::engine_fixture(
            3,
            Some((0, "TransactionException.INTRINSIC_GAS_TOO_LOW")),
        );
        fixture.lastblockhash = fixture.genesis_hash();
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.invalid.insert(
            fixture.engine_new_payloads[0].block_hash(),
            "intrinsic gas too low: have 0, want 21000".into(),
        );

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(target.new_payload_calls, 1);
        assert_eq!(target.head.number, 0);
    }

    #[tokio::test]
    async fn test_account_left_behind_is_unexpected() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        let deleted = Address::repeat_byte(0xcc);
        fixture.post_state.as_mut().unwrap().remove(&deleted);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::StateMismatch);
        assert_eq!(
            failure.mismatches.as_ref().unwrap().mismatches(),
            &[Mismatch::UnexpectedAccount { address: deleted }]
        );
    }

    #[tokio::test]
    async fn test_cleared_slot_left_behind() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        let contract = Address::repeat_byte(0xcc);
        fixture
            .post_state
            .as_mut()
            .unwrap()
            .get_mut(&contract)
            .unwrap()
            .storage
            .clear();
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(
            failure.mismatches.as_ref().unwrap().mismatches(),
            &[Mismatch::Storage {
                address: contract,
                key: U256::from(1),
                expected: U256::ZERO,
                observed: U256::from(0xff),
            }]
        );
    }

    #[tokio::test]
    async fn test_payload_state_changes_are_checked() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        let contract = Address::repeat_byte(0xcc);
        let mut changed = fixture.pre.as_ref().unwrap()[&contract].clone();
        changed.storage.insert(U256::from(1), U256::from(5));
        fixture
            .post_state
            .as_mut()
            .unwrap()
            .insert(contract, changed.clone());
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.changes.insert(
            fixture.engine_new_payloads[0].block_hash(),
            [(contract, changed)].into_iter().collect(),
        );

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_unexpected_invalid_status() {
        // Given
        let fixture = test_utils::engine_fixture(2, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target
            .invalid
            .insert(fixture.engine_new_payloads[1].block_hash(), "nonce too low".into());

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        let failure = verdict.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::UnexpectedRejection);
        assert_eq!(failure.block, Some(1));
    }

    #[tokio::test]
    async fn test_expected_error_code() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        fixture.engine_new_payloads[0].error_code = Some(-38005);
        fixture.lastblockhash = fixture.genesis_hash();
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.rpc_errors.insert(
            fixture.engine_new_payloads[0].block_hash(),
            (-38005, "Unsupported fork".into()),
        );

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_error_code_mismatch() {
        // Given
        let fixture = test_utils::engine_fixture(1, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.rpc_errors.insert(
            fixture.engine_new_payloads[0].block_hash(),
            (-32602, "Invalid params".into()),
        );

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::ProtocolErrorMismatch)
        );
    }

    #[tokio::test]
    async fn test_syncing_is_polled_until_decided() {
        // Given
        let fixture = test_utils::engine_fixture(1, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.syncing_rounds = 3;

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
        assert_eq!(target.new_payload_calls, 4);
    }

    #[tokio::test]
    async fn test_syncing_forever_times_out() {
        // Given
        let fixture = test_utils::engine_fixture(1, None);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);
        target.syncing_rounds = usize::MAX;

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_genesis_mismatch() {
        // Given
        let fixture = test_utils::engine_fixture(1, None);
        let pre = fixture.pre.clone().unwrap();
        let mut other = test_utils::engine_fixture(1, None);
        other.genesis_block_header.timestamp = alloy_primitives::U256::from(42);
        let mut target = FakeEngineTarget::for_fixture(&other);

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::SetupError)
        );
        assert_eq!(target.new_payload_calls, 0);
    }

    #[tokio::test]
    async fn test_post_state_root() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        fixture.post_state = None;
        fixture.post_state_hash = Some(test_utils::STATE_ROOT);
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn test_wrong_version_is_fixture_construction() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        fixture.engine_new_payloads[0].version = 2;
        let pre = fixture.pre.clone().unwrap();
        let mut target = FakeEngineTarget::for_fixture(&fixture);

        // When
        let verdict = consume_payloads(&fixture, &pre, &mut target, &ctx()).await;

        // Then
        assert_eq!(
            verdict.failure().map(|f| f.kind.clone()),
            Some(FailureKind::FixtureConstruction)
        );
    }
}
