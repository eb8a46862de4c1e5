//! Runs the members of a pre-allocation group against a single client.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use alloy_primitives::{B256, U256};
use ef_fixtures::{
    diff_alloc, reconstruct_from_diff, Alloc, AllocDiff, BlockchainFixture, ExpectedPost,
    PreAllocGroup,
};
use tracing::{debug, info, warn};

use crate::engine::{consume_payloads, BlockchainEngine, RunContext};
use crate::models::case::FixtureCase;
use crate::models::result::{CaseResult, Failure, FailureKind, Verdict};
use crate::targets::rpc::{ForkchoiceState, PayloadStatusKind};
use crate::traits::{
    read_state, state_hint, BlockTarget, ClientLauncher, ClientSpec, EngineTarget, GenesisInfo,
};

/// A fixture belonging to a group.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub path: PathBuf,
    pub name: String,
    pub fixture: BlockchainFixture,
}

impl From<FixtureCase> for GroupMember {
    fn from(case: FixtureCase) -> Self {
        Self {
            path: case.path,
            name: case.name,
            fixture: case.fixture,
        }
    }
}

/// Runs `members` in order on one client started from the group's genesis.
///
/// The chain is reset to genesis between members. A client that timed out,
/// faulted or could not be reset is replaced before the next member.
pub async fn run_group<L: ClientLauncher>(
    launcher: &L,
    group: Arc<PreAllocGroup>,
    members: &[GroupMember],
    ctx: &RunContext,
) -> Vec<CaseResult> {
    let Some(first) = members.first() else {
        return Vec::new();
    };
    let spec = ClientSpec {
        client_id: ctx.client_id.clone(),
        fork: group.network,
        genesis: first.fixture.genesis_block_header.clone(),
        pre: Arc::new(group.pre.clone()),
        chain_id: first
            .fixture
            .config
            .as_ref()
            .map_or(U256::from(1), |config| config.chainid),
        label: format!("{} ({} fixtures)", first.name, members.len()),
    };
    let genesis_hash = first.fixture.genesis_hash();
    let reset_version = first
        .fixture
        .engine_fcu_version
        .or_else(|| group.network.forkchoice_version());

    let mut results = Vec::with_capacity(members.len());
    let mut client = match launcher.start(&spec).await {
        Ok(client) => Some(client),
        Err(err) => {
            warn!("could not start {} for group: {err}", ctx.client_id);
            None
        }
    };

    let mut remaining = members.iter().enumerate();
    while let Some((index, member)) = remaining.next() {
        let Some(target) = client.as_mut() else {
            results.push(unavailable(member));
            continue;
        };

        let started = Instant::now();
        let verdict = if member.fixture.genesis_hash() == genesis_hash {
            consume_payloads(&member.fixture, &group.pre, target, ctx).await
        } else {
            Failure::new(FailureKind::SetupError)
                .with_message("fixture genesis differs from the group genesis")
                .into()
        };
        let poisoned = verdict
            .failure()
            .is_some_and(|failure| failure.kind.poisons_client());
        let mut result = CaseResult::new(&member.path, &member.name, Ok(verdict.clone()));
        if verdict.is_pass() {
            if let Some(diff) = observed_diff(&member.fixture, &group.pre, target).await {
                result = result.with_post_diff(diff);
            }
        }
        results.push(result.with_duration(started.elapsed()));

        if index + 1 == members.len() {
            break;
        }

        let reset = !poisoned && reset_to_genesis(target, genesis_hash, reset_version, ctx).await;
        if ctx.cancel.is_cancelled() {
            if !reset {
                warn!("group abandoned after cancellation");
            }
            results.extend(remaining.map(|(_, member)| cancelled(member)));
            break;
        }
        if !reset {
            client = restart(launcher, &spec, client.take()).await;
        }
    }

    if let Some(client) = client {
        if let Err(err) = launcher.stop(client).await {
            warn!("could not stop {}: {err}", ctx.client_id);
        }
    }
    results
}

/// Runs direct `members` in order on one block target.
///
/// Members after the first start from the genesis the target already holds.
/// The target is initialized again after a failure that leaves it unusable,
/// or when a member's genesis differs from the one it holds.
pub async fn run_block_group<T: BlockTarget>(
    target: &mut T,
    pre: &Alloc,
    members: &[GroupMember],
    ctx: &RunContext,
) -> Vec<CaseResult> {
    let mut genesis: Option<GenesisInfo> = None;
    let mut results = Vec::with_capacity(members.len());
    for (index, member) in members.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            results.extend(members[index..].iter().map(cancelled));
            break;
        }
        let started = Instant::now();
        let mut engine = BlockchainEngine::new(&member.fixture, pre, &mut *target, ctx);
        if let Some(info) = genesis.filter(|info| info.hash == member.fixture.genesis_hash()) {
            debug!("resuming {} from genesis {}", member.name, info.hash);
            engine = engine.resuming(info);
        }
        let verdict = engine.run().await;
        genesis = engine.genesis();
        if verdict
            .failure()
            .is_some_and(|failure| failure.kind.poisons_client())
        {
            genesis = None;
        }
        results.push(
            CaseResult::new(&member.path, &member.name, Ok(verdict))
                .with_duration(started.elapsed()),
        );
    }
    results
}

/// Points the head back at the group genesis.
async fn reset_to_genesis<T: EngineTarget>(
    target: &mut T,
    genesis_hash: B256,
    version: Option<u8>,
    ctx: &RunContext,
) -> bool {
    let Some(version) = version else {
        return false;
    };
    // Not raced against cancellation: a cancelled member must still leave
    // the client at genesis.
    let state = ForkchoiceState::head(genesis_hash);
    match tokio::time::timeout(ctx.call_timeout, target.forkchoice_updated(version, state)).await
    {
        Ok(Ok(status)) if status.status == PayloadStatusKind::Valid => {
            debug!("client reset to genesis {genesis_hash}");
            true
        }
        Ok(Ok(status)) => {
            warn!("reset to genesis returned {:?}", status.status);
            false
        }
        Ok(Err(err)) => {
            warn!("reset to genesis failed: {err}");
            false
        }
        Err(_) => {
            warn!("reset to genesis timed out");
            false
        }
    }
}

async fn restart<L: ClientLauncher>(
    launcher: &L,
    spec: &ClientSpec,
    client: Option<L::Client>,
) -> Option<L::Client> {
    if let Some(client) = client {
        if let Err(err) = launcher.stop(client).await {
            warn!("could not stop {}: {err}", spec.client_id);
        }
    }
    info!("restarting {} for group {}", spec.client_id, spec.label);
    match launcher.start(spec).await {
        Ok(client) => Some(client),
        Err(err) => {
            warn!("could not restart {}: {err}", spec.client_id);
            None
        }
    }
}

/// The changes the member made to the shared pre-state, as read back from
/// the client.
async fn observed_diff<T: EngineTarget>(
    fixture: &BlockchainFixture,
    pre: &Alloc,
    target: &mut T,
) -> Option<AllocDiff> {
    let expected = match fixture.expected_post().ok()? {
        ExpectedPost::Full(alloc) => alloc.clone(),
        ExpectedPost::Diff(diff) => reconstruct_from_diff(pre, diff),
        ExpectedPost::Root(_) => return None,
    };
    let hint = state_hint(pre, &expected);
    match read_state(target, &hint).await {
        Ok(observed) => Some(diff_alloc(pre, &observed)),
        Err(err) => {
            debug!("could not read post state for diff: {err}");
            None
        }
    }
}

fn unavailable(member: &GroupMember) -> CaseResult {
    CaseResult::new(
        &member.path,
        &member.name,
        Ok(Failure::new(FailureKind::ClientFault)
            .with_message("client could not be started")
            .into()),
    )
}

fn cancelled(member: &GroupMember) -> CaseResult {
    CaseResult::new(
        &member.path,
        &member.name,
        Ok(Verdict::from(Failure::new(FailureKind::Cancelled))),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use std::collections::HashMap;

    use crate::test_utils::{self, FakeBlockTarget, FakeLauncher};
    use alloy_primitives::{keccak256, Address};
    use ef_fixtures::{group_fixtures, ExceptionMapper};

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(Arc::new(ExceptionMapper::bundled().unwrap()), "geth");
        ctx.call_timeout = Duration::from_millis(200);
        ctx
    }

    fn members(count: usize) -> (Arc<PreAllocGroup>, Vec<GroupMember>) {
        let members: Vec<GroupMember> = (0..count)
            .map(|i| GroupMember {
                path: PathBuf::from("fixtures/group.json"),
                name: format!("test_{i}"),
                fixture: test_utils::engine_fixture(i + 1, None),
            })
            .collect();
        let groups = group_fixtures(
            members
                .iter()
                .map(|member| (member.name.as_str(), &member.fixture)),
        )
        .unwrap();
        assert_eq!(groups.len(), 1);
        let group = groups.into_values().next().unwrap();
        (Arc::new(group), members)
    }

    #[tokio::test]
    async fn test_members_share_one_client() {
        // Given
        let (group, members) = members(3);
        let launcher = FakeLauncher::default();

        // When
        let results = run_group(&launcher, group, &members, &ctx()).await;

        // Then
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(CaseResult::is_pass));
        assert!(results.iter().all(|r| r.post_diff == Some(AllocDiff::new())));
        assert_eq!(launcher.started.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_restarts_client() {
        // Given
        let (group, members) = members(3);
        let launcher = FakeLauncher {
            refuse_reset: true,
            ..Default::default()
        };

        // When
        let results = run_group(&launcher, group, &members, &ctx()).await;

        // Then
        assert!(results.iter().all(CaseResult::is_pass));
        assert_eq!(launcher.started.load(Ordering::SeqCst), 3);
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_restart_faults_remaining_members() {
        // Given
        let (group, members) = members(3);
        let launcher = FakeLauncher {
            refuse_reset: true,
            max_starts: Some(1),
            ..Default::default()
        };

        // When
        let results = run_group(&launcher, group, &members, &ctx()).await;

        // Then
        assert!(results[0].is_pass());
        for result in &results[1..] {
            let failure = result.result.as_ref().unwrap().failure().unwrap();
            assert_eq!(failure.kind, FailureKind::ClientFault);
        }
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_reports_remaining_members() {
        // Given
        let (group, members) = members(3);
        let launcher = FakeLauncher::default();
        let ctx = ctx();
        ctx.cancel.cancel();

        // When
        let results = run_group(&launcher, group, &members, &ctx).await;

        // Then
        assert_eq!(results.len(), 3);
        for result in &results {
            let failure = result.result.as_ref().unwrap().failure().unwrap();
            assert_eq!(failure.kind, FailureKind::Cancelled);
        }
        assert_eq!(launcher.resets.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.stopped.load(Ordering::SeqCst), 1);
    }

    fn member(name: &str, fixture: BlockchainFixture) -> GroupMember {
        GroupMember {
            path: PathBuf::from("fixtures/group.json"),
            name: name.to_string(),
            fixture,
        }
    }

    /// Writes 5 into slot 1 of the contract in `fixture`'s post-state and
    /// returns the account as the block `hash` leaves it.
    fn write_slot(fixture: &mut BlockchainFixture, hash: B256) -> HashMap<B256, Alloc> {
        let contract = Address::repeat_byte(0xcc);
        let post = fixture.post_state.as_mut().unwrap();
        let written = post.get_mut(&contract).unwrap();
        written.storage.insert(U256::from(1), U256::from(5));
        [(hash, [(contract, written.clone())].into_iter().collect())]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn test_reset_rolls_back_member_changes() {
        // Given
        let mut writer = test_utils::engine_fixture(1, None);
        let block_hash = keccak256(b"writes slot 1");
        writer.engine_new_payloads[0].execution_payload.block_hash = block_hash;
        writer.lastblockhash = block_hash;
        let changes = write_slot(&mut writer, block_hash);
        let members = vec![
            member("test_writer", writer),
            member("test_reader", test_utils::engine_fixture(1, None)),
        ];
        let groups = group_fixtures(
            members
                .iter()
                .map(|member| (member.name.as_str(), &member.fixture)),
        )
        .unwrap();
        assert_eq!(groups.len(), 1);
        let group = Arc::new(groups.into_values().next().unwrap());
        let launcher = FakeLauncher {
            changes,
            ..Default::default()
        };

        // When
        let results = run_group(&launcher, group, &members, &ctx()).await;

        // Then
        assert!(results.iter().all(CaseResult::is_pass));
        assert_ne!(results[0].post_diff, Some(AllocDiff::new()));
        assert_eq!(results[1].post_diff, Some(AllocDiff::new()));
        assert_eq!(launcher.started.load(Ordering::SeqCst), 1);
        assert_eq!(launcher.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_block_group_resumes_from_genesis() {
        // Given
        let mut writer = test_utils::fixture(1, None);
        let block_hash = writer.lastblockhash;
        let changes = write_slot(&mut writer, block_hash);
        let members = vec![
            member("test_writer", writer),
            member("test_reader", test_utils::fixture(0, None)),
        ];
        let pre = test_utils::pre_alloc();
        let mut target = FakeBlockTarget::with_changes(changes);

        // When
        let results = run_block_group(&mut target, &pre, &members, &ctx()).await;

        // Then
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(CaseResult::is_pass));
        assert_eq!(target.inits, 1);
        assert_eq!(target.applied, 1);
    }

    #[tokio::test]
    async fn test_block_group_reinitializes_on_new_genesis() {
        // Given
        let mut other = test_utils::fixture(0, None);
        other.genesis_block_header.gas_limit += U256::from(1);
        other.lastblockhash = other.genesis_hash();
        let members = vec![
            member("test_first", test_utils::fixture(1, None)),
            member("test_other", other),
            member("test_third", test_utils::fixture(1, None)),
        ];
        let pre = test_utils::pre_alloc();
        let mut target = FakeBlockTarget::default();

        // When
        let results = run_block_group(&mut target, &pre, &members, &ctx()).await;

        // Then
        assert!(results.iter().all(CaseResult::is_pass));
        assert_eq!(target.inits, 3);
    }

    #[tokio::test]
    async fn test_block_group_reinitializes_after_timeout() {
        // Given
        let members = vec![
            member("test_first", test_utils::fixture(1, None)),
            member("test_second", test_utils::fixture(0, None)),
        ];
        let pre = test_utils::pre_alloc();
        let mut target = FakeBlockTarget::with_delay(Duration::from_secs(5));

        // When
        let results = run_block_group(&mut target, &pre, &members, &ctx()).await;

        // Then
        let failure = results[0].result.as_ref().unwrap().failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(results[1].is_pass());
        assert_eq!(target.inits, 2);
    }

    #[tokio::test]
    async fn test_block_group_cancellation() {
        // Given
        let members = vec![
            member("test_first", test_utils::fixture(1, None)),
            member("test_second", test_utils::fixture(1, None)),
        ];
        let pre = test_utils::pre_alloc();
        let mut target = FakeBlockTarget::default();
        let ctx = ctx();
        ctx.cancel.cancel();

        // When
        let results = run_block_group(&mut target, &pre, &members, &ctx).await;

        // Then
        assert_eq!(results.len(), 2);
        for result in &results {
            let failure = result.result.as_ref().unwrap().failure().unwrap();
            assert_eq!(failure.kind, FailureKind::Cancelled);
        }
        assert_eq!(target.inits, 0);
    }
}
