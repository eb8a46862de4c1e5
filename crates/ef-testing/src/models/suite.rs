// Inspired by https://github.com/paradigmxyz/reth/tree/main/testing/ef-tests
// Modified to use async running

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ef_fixtures::{group_fixtures, Alloc, PreAllocGroup, PreAllocHash, PRE_ALLOC_DIR};
use rayon::prelude::*;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::case::{Cases, FixtureCase};
use super::error::RunnerError;
use super::result::{CaseResult, Failure, FailureKind, Verdict};
use crate::cancellation::Cancellation;
use crate::config::{ConsumeMode, RunnerConfig};
use crate::engine::{consume_blocks, RunContext};
use crate::filter::Filter;
use crate::grouping::{run_block_group, run_group, GroupMember};
use crate::targets::command::BlocktestCommand;
use crate::targets::hive::HiveLauncher;
use crate::targets::transition::{CommandTransitionTool, TransitionTarget, TransitionTool};
use crate::traits::ClientLauncher;

/// All fixtures found under a directory.
pub struct FixtureSuite {
    pub root: PathBuf,
    filter: Filter,
}

impl FixtureSuite {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, filter: Filter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    /// Fixture files under the root, in path order. Group files are not
    /// fixtures.
    pub fn discover(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|entry| entry.file_name() != PRE_ALLOC_DIR)
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("could not read fixture directory entry: {err}");
                    None
                }
            })
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();
        files
    }

    /// Loads every discovered file in parallel and applies the skip filter.
    pub fn load(&self) -> Cases {
        self.discover()
            .par_iter()
            .map(|path| {
                if self.filter.is_skipped(path, None) {
                    return Cases {
                        test_cases: Vec::new(),
                        settled: vec![CaseResult::new(path, &file_label(path), Err(RunnerError::Skipped))],
                    };
                }
                match Cases::load(path) {
                    Ok(mut cases) => {
                        cases.apply_filter(&self.filter);
                        cases
                    }
                    Err(err) => Cases {
                        test_cases: Vec::new(),
                        settled: vec![CaseResult::new(path, &file_label(path), Err(err))],
                    },
                }
            })
            .reduce(Cases::default, |mut acc, cases| {
                acc.extend(cases);
                acc
            })
    }

    /// Runs the suite with the transport selected by `config`.
    pub async fn run(&self, config: &RunnerConfig, cancel: Cancellation) -> eyre::Result<Vec<CaseResult>> {
        let ctx = config.run_context(cancel)?;
        let cases = self.load();
        info!(
            "consuming {} fixtures from {} in {} mode",
            cases.len(),
            self.root.display(),
            config.mode
        );

        let results = match config.mode {
            ConsumeMode::Transition => {
                let tool = CommandTransitionTool::new(&config.t8n_bin)
                    .with_subcommand(config.t8n_subcommand.clone());
                run_transition(tool, cases, &self.root, &ctx, config.workers).await
            }
            ConsumeMode::Blocktest => {
                let binary = config
                    .blocktest_bin
                    .clone()
                    .ok_or_else(|| eyre::eyre!("BLOCKTEST_BIN is required in blocktest mode"))?;
                let command = BlocktestCommand::new(binary, config.block_timeout);
                run_blocktest(command, cases, &ctx, config.workers).await
            }
            ConsumeMode::Engine => {
                let simulator = config
                    .hive_simulator
                    .as_deref()
                    .ok_or_else(|| eyre::eyre!("HIVE_SIMULATOR is required in engine mode"))?;
                let launcher = Arc::new(
                    HiveLauncher::start_suite(
                        simulator,
                        &format!("consume-engine-{}", config.client_id),
                        config.hive_client(),
                        config.block_timeout,
                    )
                    .await?,
                );
                let results =
                    run_engine(Arc::clone(&launcher), cases, &self.root, &ctx, config.workers).await;
                match Arc::try_unwrap(launcher) {
                    Ok(launcher) => launcher.end_suite().await?,
                    Err(_) => warn!("hive suite still in use, not ending it"),
                }
                results
            }
        };
        Ok(results)
    }
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Bounded set of concurrent workers, each producing results.
struct Workers {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<Vec<CaseResult>>,
}

impl Workers {
    fn new(workers: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Waits for a free slot, then spawns `task`.
    async fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Vec<CaseResult>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
            error!("worker pool closed");
            return;
        };
        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
    }

    async fn join(mut self, mut results: Vec<CaseResult>) -> Vec<CaseResult> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(batch) => results.extend(batch),
                Err(err) => {
                    error!("worker failed: {err}");
                    results.push(CaseResult::new(
                        Path::new(""),
                        "worker",
                        Err(RunnerError::Other(err.to_string())),
                    ));
                }
            }
        }
        results.sort_by(|a, b| (&a.path, &a.name).cmp(&(&b.path, &b.name)));
        results
    }
}

fn cancelled(case: &FixtureCase) -> CaseResult {
    case.result(Ok(Failure::new(FailureKind::Cancelled).into()))
}

/// Executes every direct fixture block by block through `tool`. Fixtures
/// sharing a group file run in order on one target.
pub async fn run_transition<T>(
    tool: T,
    cases: Cases,
    fixtures_dir: &Path,
    ctx: &RunContext,
    workers: usize,
) -> Vec<CaseResult>
where
    T: TransitionTool + Clone + 'static,
{
    let mut settled = cases.settled;
    let mut grouped: BTreeMap<PreAllocHash, Vec<FixtureCase>> = BTreeMap::new();
    let mut inline: Vec<(FixtureCase, Alloc)> = Vec::new();
    for case in cases.test_cases {
        if case.fixture.is_engine() {
            settled.push(case.result(Ok(Failure::new(FailureKind::FixtureConstruction)
                .with_message("engine fixtures need an Engine-API client")
                .into())));
            continue;
        }
        match (case.fixture.pre.clone(), case.fixture.pre_hash) {
            (Some(pre), _) => inline.push((case, pre)),
            (None, Some(hash)) => grouped.entry(hash).or_default().push(case),
            (None, None) => settled.push(case.result(Err(RunnerError::Other(
                "fixture has no pre-state".into(),
            )))),
        }
    }

    let mut pool = Workers::new(workers);
    for (hash, members) in grouped {
        let group = match PreAllocGroup::load(fixtures_dir, &hash) {
            Ok(group) => group,
            Err(err) => {
                let message = err.to_string();
                settled.extend(members.iter().map(|case| {
                    case.result(Err(RunnerError::Other(message.clone())))
                }));
                continue;
            }
        };
        let Some(chain_id) = members.first().map(FixtureCase::chain_id) else {
            continue;
        };
        let members: Vec<GroupMember> = members.into_iter().map(GroupMember::from).collect();
        let tool = tool.clone();
        let ctx = ctx.clone();
        pool.spawn(async move {
            let mut target = TransitionTarget::new(tool, chain_id);
            run_block_group(&mut target, &group.pre, &members, &ctx).await
        })
        .await;
    }

    for (case, pre) in inline {
        let tool = tool.clone();
        let ctx = ctx.clone();
        pool.spawn(async move {
            if ctx.cancel.is_cancelled() {
                return vec![cancelled(&case)];
            }
            let started = Instant::now();
            let mut target = TransitionTarget::new(tool, case.chain_id());
            let verdict = consume_blocks(&case.fixture, &pre, &mut target, &ctx).await;
            vec![case.result(Ok(verdict)).with_duration(started.elapsed())]
        })
        .await;
    }
    pool.join(settled).await
}

/// Hands each fixture file to the client's `blocktest` command.
pub async fn run_blocktest(
    command: BlocktestCommand,
    cases: Cases,
    ctx: &RunContext,
    workers: usize,
) -> Vec<CaseResult> {
    let mut by_file: BTreeMap<PathBuf, Vec<FixtureCase>> = BTreeMap::new();
    for case in cases.test_cases {
        by_file.entry(case.path.clone()).or_default().push(case);
    }

    let command = Arc::new(command);
    let mut pool = Workers::new(workers);
    for (path, file_cases) in by_file {
        let command = Arc::clone(&command);
        let cancel = ctx.cancel.clone();
        pool.spawn(async move {
            if cancel.is_cancelled() {
                return file_cases.iter().map(cancelled).collect();
            }
            let started = Instant::now();
            match command.run_file(&path).await {
                Ok(mut verdicts) => file_cases
                    .iter()
                    .map(|case| {
                        let verdict = verdicts.remove(&case.name).unwrap_or_else(|| {
                            Failure::new(FailureKind::ClientFault)
                                .with_message("missing from the blocktest report")
                                .into()
                        });
                        case.result(Ok(verdict)).with_duration(started.elapsed())
                    })
                    .collect(),
                Err(err) => {
                    let message = err.to_string();
                    file_cases
                        .iter()
                        .map(|case| {
                            case.result(Ok(Verdict::from(
                                Failure::new(FailureKind::ClientFault).with_message(message.clone()),
                            )))
                        })
                        .collect()
                }
            }
        })
        .await;
    }
    pool.join(cases.settled).await
}

/// Groups Engine-API fixtures by pre-state and runs every group on its own
/// client.
pub async fn run_engine<L>(
    launcher: Arc<L>,
    cases: Cases,
    fixtures_dir: &Path,
    ctx: &RunContext,
    workers: usize,
) -> Vec<CaseResult>
where
    L: ClientLauncher + 'static,
{
    let mut settled = cases.settled;
    let mut grouped: BTreeMap<PreAllocHash, Vec<FixtureCase>> = BTreeMap::new();
    let mut inline = Vec::new();
    for case in cases.test_cases {
        if !case.fixture.is_engine() {
            settled.push(case.result(Ok(Failure::new(FailureKind::FixtureConstruction)
                .with_message("fixture has no engine payloads")
                .into())));
        } else if let Some(hash) = case.fixture.pre_hash {
            grouped.entry(hash).or_default().push(case);
        } else {
            inline.push(case);
        }
    }

    let mut groups: Vec<(Arc<PreAllocGroup>, Vec<FixtureCase>)> = Vec::new();
    for (hash, members) in grouped {
        match PreAllocGroup::load(fixtures_dir, &hash) {
            Ok(group) => groups.push((Arc::new(group), members)),
            Err(err) => {
                let message = err.to_string();
                settled.extend(members.iter().map(|case| {
                    case.result(Err(RunnerError::Other(message.clone())))
                }));
            }
        }
    }
    match group_inline(inline) {
        Ok(inline_groups) => groups.extend(inline_groups),
        Err((members, err)) => settled.extend(
            members
                .iter()
                .map(|case| case.result(Err(RunnerError::Other(err.clone())))),
        ),
    }

    let mut pool = Workers::new(workers);
    for (group, members) in groups {
        let launcher = Arc::clone(&launcher);
        let ctx = ctx.clone();
        let members: Vec<GroupMember> = members.into_iter().map(GroupMember::from).collect();
        pool.spawn(async move { run_group(launcher.as_ref(), group, &members, &ctx).await })
            .await;
    }
    pool.join(settled).await
}

type InlineGroups = Vec<(Arc<PreAllocGroup>, Vec<FixtureCase>)>;

/// Buckets fixtures carrying their own pre-state by group key.
fn group_inline(cases: Vec<FixtureCase>) -> Result<InlineGroups, (Vec<FixtureCase>, String)> {
    let ids: Vec<String> = cases
        .iter()
        .map(|case| format!("{}::{}", case.path.display(), case.name))
        .collect();
    let groups = match group_fixtures(ids.iter().map(String::as_str).zip(cases.iter().map(|c| &c.fixture))) {
        Ok(groups) => groups,
        Err(err) => return Err((cases, err.to_string())),
    };

    let mut by_id: HashMap<String, FixtureCase> = ids.into_iter().zip(cases).collect();
    Ok(groups
        .into_values()
        .map(|group| {
            let members = group
                .test_ids
                .iter()
                .filter_map(|id| by_id.remove(id))
                .collect();
            (Arc::new(group), members)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{self, FakeLauncher};
    use ef_fixtures::ExceptionMapper;
    use std::fs;
    use std::sync::atomic::Ordering;

    fn ctx() -> RunContext {
        RunContext::new(Arc::new(ExceptionMapper::bundled().unwrap()), "geth")
    }

    fn case(name: &str, fixture: ef_fixtures::BlockchainFixture) -> FixtureCase {
        FixtureCase {
            path: PathBuf::from("fixtures/test.json"),
            name: name.into(),
            fixture,
        }
    }

    #[test]
    fn test_discover_skips_group_files() {
        // Given
        let root = std::env::temp_dir().join("ef-consume-discover");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join(PRE_ALLOC_DIR)).unwrap();
        fs::create_dir_all(root.join("cancun")).unwrap();
        fs::write(root.join("cancun/b.json"), "{}").unwrap();
        fs::write(root.join("a.json"), "{}").unwrap();
        fs::write(root.join("notes.md"), "").unwrap();
        fs::write(root.join(PRE_ALLOC_DIR).join("0x01.json"), "{}").unwrap();
        let suite = FixtureSuite::new(&root, Filter::default());

        // When
        let files = suite.discover();

        // Then
        assert_eq!(files, vec![root.join("a.json"), root.join("cancun/b.json")]);
    }

    #[test]
    fn test_load_reports_unreadable_files() {
        // Given
        let root = std::env::temp_dir().join("ef-consume-load");
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let fixture = test_utils::fixture(1, None);
        let file = serde_json::json!({ "ok": test_utils::fixture_json(&fixture) });
        fs::write(root.join("good.json"), file.to_string()).unwrap();
        fs::write(root.join("bad.json"), "not json").unwrap();
        let suite = FixtureSuite::new(&root, Filter::default());

        // When
        let cases = suite.load();

        // Then
        assert_eq!(cases.test_cases.len(), 1);
        assert_eq!(cases.settled.len(), 1);
        assert_eq!(cases.settled[0].name, "bad");
        assert!(matches!(
            cases.settled[0].result,
            Err(RunnerError::CouldNotDeserialize { .. })
        ));
    }

    #[tokio::test]
    async fn test_engine_mode_groups_shared_pre() {
        // Given
        let cases = Cases {
            test_cases: vec![
                case("a", test_utils::engine_fixture(1, None)),
                case("b", test_utils::engine_fixture(2, None)),
                case("direct", test_utils::fixture(1, None)),
            ],
            settled: Vec::new(),
        };
        let launcher = Arc::new(FakeLauncher::default());

        // When
        let results = run_engine(Arc::clone(&launcher), cases, Path::new("fixtures"), &ctx(), 2).await;

        // Then
        assert_eq!(results.len(), 3);
        let by_name: HashMap<&str, &CaseResult> =
            results.iter().map(|r| (r.name.as_str(), r)).collect();
        assert!(by_name["a"].is_pass());
        assert!(by_name["b"].is_pass());
        let failure = by_name["direct"].result.as_ref().unwrap().failure().unwrap();
        assert_eq!(failure.kind, FailureKind::FixtureConstruction);
        assert_eq!(launcher.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_group_file() {
        // Given
        let mut fixture = test_utils::engine_fixture(1, None);
        fixture.pre = None;
        fixture.pre_hash = Some(PreAllocHash(alloy_primitives::B256::repeat_byte(1)));
        let cases = Cases {
            test_cases: vec![case("grouped", fixture)],
            settled: Vec::new(),
        };
        let launcher = Arc::new(FakeLauncher::default());
        let root = std::env::temp_dir().join("ef-consume-no-groups");

        // When
        let results = run_engine(Arc::clone(&launcher), cases, &root, &ctx(), 1).await;

        // Then
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].result, Err(RunnerError::Other(_))));
        assert_eq!(launcher.started.load(Ordering::SeqCst), 0);
    }
}
