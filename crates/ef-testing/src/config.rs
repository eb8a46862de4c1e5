//! Runner configuration, read from the environment and an optional `.env`.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ef_fixtures::{ExceptionMapper, MatchPolicy};
use eyre::{eyre, Result, WrapErr};
use strum::{Display, EnumString};

use crate::cancellation::Cancellation;
use crate::engine::RunContext;

/// How fixtures reach the system under test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ConsumeMode {
    /// Blocks executed one by one through a state-transition tool.
    #[default]
    Transition,
    /// Whole fixture files handed to the client's `blocktest` command.
    Blocktest,
    /// Payloads sent over the Engine API to clients started by hive.
    Engine,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub fixtures_path: PathBuf,
    pub mode: ConsumeMode,
    pub client_id: String,
    pub t8n_bin: PathBuf,
    pub t8n_subcommand: Vec<String>,
    pub blocktest_bin: Option<PathBuf>,
    pub hive_simulator: Option<String>,
    pub hive_client: Option<String>,
    pub block_timeout: Duration,
    pub syncing_timeout: Duration,
    pub workers: usize,
    pub policy: MatchPolicy,
    pub exception_mappers: Option<PathBuf>,
    pub skip_file: Option<PathBuf>,
}

impl RunnerConfig {
    /// Loads `.env` when present, then reads the process environment.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let secs = |key: &str, default: u64| -> Result<Duration> {
            get(key)
                .map(|value| value.trim().parse::<u64>())
                .transpose()
                .wrap_err_with(|| format!("invalid {key}"))
                .map(|secs| Duration::from_secs(secs.unwrap_or(default)))
        };

        let fixtures_path = get("FIXTURES_PATH")
            .map(PathBuf::from)
            .ok_or_else(|| eyre!("Missing FIXTURES_PATH"))?;
        let mode = get("CONSUME_MODE")
            .map(|mode| mode.trim().parse::<ConsumeMode>())
            .transpose()
            .wrap_err("invalid CONSUME_MODE, expected transition, blocktest or engine")?
            .unwrap_or_default();
        let client_id = get("CLIENT_ID").unwrap_or_else(|| "geth".to_string());
        let workers = match get("WORKERS") {
            Some(workers) => workers.trim().parse().wrap_err("invalid WORKERS")?,
            None => std::thread::available_parallelism().map_or(1, usize::from),
        };
        let policy = match get("EXCEPTION_MATCHING") {
            Some(policy) => policy.parse()?,
            None => MatchPolicy::Strict,
        };

        let config = Self {
            fixtures_path,
            mode,
            t8n_bin: get("T8N_BIN").map_or_else(|| PathBuf::from("evm"), PathBuf::from),
            t8n_subcommand: get("T8N_SUBCOMMAND")
                .map_or_else(|| "t8n".to_string(), |s| s)
                .split_whitespace()
                .map(ToString::to_string)
                .collect(),
            blocktest_bin: get("BLOCKTEST_BIN").map(PathBuf::from),
            hive_simulator: get("HIVE_SIMULATOR"),
            hive_client: get("HIVE_CLIENT"),
            block_timeout: secs("BLOCK_TIMEOUT_SECS", 60)?,
            syncing_timeout: secs("SYNCING_TIMEOUT_SECS", 10)?,
            workers: workers.max(1),
            policy,
            exception_mappers: get("EXCEPTION_MAPPERS").map(PathBuf::from),
            skip_file: get("SKIP_FILE").map(PathBuf::from),
            client_id,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.mode {
            ConsumeMode::Blocktest if self.blocktest_bin.is_none() => {
                Err(eyre!("BLOCKTEST_BIN is required in blocktest mode"))
            }
            ConsumeMode::Engine if self.hive_simulator.is_none() => {
                Err(eyre!("HIVE_SIMULATOR is required in engine mode"))
            }
            _ => Ok(()),
        }
    }

    /// The hive client image to start, defaulting to the client id.
    pub fn hive_client(&self) -> &str {
        self.hive_client.as_deref().unwrap_or(&self.client_id)
    }

    /// Bundled mapper rules, extended by `EXCEPTION_MAPPERS` when set.
    pub fn mapper(&self) -> Result<ExceptionMapper> {
        let bundled = ExceptionMapper::bundled()?;
        let Some(path) = &self.exception_mappers else {
            return Ok(bundled);
        };
        let extra = ExceptionMapper::from_file(path)
            .wrap_err_with(|| format!("could not load mapper rules from {}", path.display()))?;
        Ok(bundled.merged(extra))
    }

    pub fn run_context(&self, cancel: Cancellation) -> Result<RunContext> {
        let mapper = self.mapper()?;
        if !mapper.knows(&self.client_id) {
            tracing::warn!(
                "no exception mapper for {}, every rejection will be unmapped",
                self.client_id
            );
        }
        self.policy.warn_if_relaxed(&self.client_id);

        let mut ctx = RunContext::new(Arc::new(mapper), self.client_id.clone());
        ctx.policy = self.policy;
        ctx.call_timeout = self.block_timeout;
        ctx.syncing_timeout = self.syncing_timeout;
        ctx.cancel = cancel;
        Ok(ctx)
    }
}
