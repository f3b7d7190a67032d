//! Configuration for conductor, read from `conductor.toml`.
//!
//! Layered file → environment → CLI. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [routing]
//! strategy = "least-loaded"
//! oversubscription_factor = 1.0
//! phase_fatal_on_no_eligible_worker = false
//! deferred_task_timeout_secs = 30.0
//! score_decay = 0.8
//!
//! [retry]
//! max_attempts = 3
//! backoff_base_secs = 1.0
//! backoff_multiplier = 2.0
//! jitter_secs = 0.0
//! critical_extra_attempt = true
//!
//! [retry.classes.flaky]
//! max_attempts = 5
//!
//! [execution]
//! task_timeout_secs = 600.0
//! tick_interval_ms = 100
//! shell = "bash"
//!
//! [reporting]
//! report_dir = ".conductor/runs"
//!
//! [[workers]]
//! id = "builder-1"
//! capabilities = ["rust", "shell"]
//! weight = 2.0
//! ```

use crate::dag::scheduler::{DEFAULT_DEFERRED_TASK_TIMEOUT, DEFAULT_TICK_INTERVAL, RunConfig};
use crate::errors::RegistryError;
use crate::registry::{CapacityRegistry, DEFAULT_OVERSUBSCRIPTION, DEFAULT_SCORE_DECAY, WorkerSpec};
use crate::retry::{RetryCoordinator, RetryPolicy};
use crate::router::{DEFAULT_VIRTUAL_NODES, Router, Strategy};
use crate::worker::CommandExecutor;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// File name looked up by `load_or_default`.
pub const CONFIG_FILE_NAME: &str = "conductor.toml";

/// Seconds as a `Duration`, clamping negatives to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

/// Worker selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub strategy: Strategy,
    /// Slots per worker = floor(weight * factor)
    #[serde(default = "default_oversubscription_factor")]
    pub oversubscription_factor: f64,
    /// Fail the phase immediately when a task has no eligible worker
    #[serde(default)]
    pub phase_fatal_on_no_eligible_worker: bool,
    /// How long a task may wait for an eligible worker
    #[serde(default = "default_deferred_task_timeout_secs")]
    pub deferred_task_timeout_secs: f64,
    /// History weight of the performance score moving average
    #[serde(default = "default_score_decay")]
    pub score_decay: f64,
    /// Seed for weighted selection and jitter; random when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Virtual nodes per worker on the affinity ring
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: usize,
}

fn default_oversubscription_factor() -> f64 {
    DEFAULT_OVERSUBSCRIPTION
}

fn default_deferred_task_timeout_secs() -> f64 {
    DEFAULT_DEFERRED_TASK_TIMEOUT.as_secs_f64()
}

fn default_score_decay() -> f64 {
    DEFAULT_SCORE_DECAY
}

fn default_virtual_nodes() -> usize {
    DEFAULT_VIRTUAL_NODES
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            oversubscription_factor: default_oversubscription_factor(),
            phase_fatal_on_no_eligible_worker: false,
            deferred_task_timeout_secs: default_deferred_task_timeout_secs(),
            score_decay: default_score_decay(),
            seed: None,
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

/// Per-class override; unset fields inherit from `[retry]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryClassOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<f64>,
}

/// Retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub jitter_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_secs: Option<f64>,
    /// Give critical tasks one more attempt after exhausting `max_attempts`
    #[serde(default = "default_critical_extra_attempt")]
    pub critical_extra_attempt: bool,
    /// Overrides keyed by task class
    #[serde(default)]
    pub classes: BTreeMap<String, RetryClassOverride>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> f64 {
    1.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_critical_extra_attempt() -> bool {
    true
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_secs: 0.0,
            max_backoff_secs: None,
            critical_extra_attempt: default_critical_extra_attempt(),
            classes: BTreeMap::new(),
        }
    }
}

impl RetrySection {
    /// The default policy.
    pub fn policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::new(
            self.max_attempts,
            secs(self.backoff_base_secs),
            self.backoff_multiplier,
        )
        .with_jitter(secs(self.jitter_secs));
        if let Some(max) = self.max_backoff_secs {
            policy = policy.with_max_backoff(secs(max));
        }
        policy
    }

    /// Policy for a class, with the override applied over the defaults.
    pub fn class_policy(&self, class: &RetryClassOverride) -> RetryPolicy {
        let mut policy = RetryPolicy::new(
            class.max_attempts.unwrap_or(self.max_attempts),
            secs(class.backoff_base_secs.unwrap_or(self.backoff_base_secs)),
            class.backoff_multiplier.unwrap_or(self.backoff_multiplier),
        )
        .with_jitter(secs(class.jitter_secs.unwrap_or(self.jitter_secs)));
        if let Some(max) = class.max_backoff_secs.or(self.max_backoff_secs) {
            policy = policy.with_max_backoff(secs(max));
        }
        policy
    }
}

/// Execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSection {
    /// Per-attempt timeout for tasks that don't declare one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_timeout_secs: Option<f64>,
    /// Re-check interval for deferred tasks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Shell that interprets task commands (defaults to `sh`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL.as_millis() as u64
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            task_timeout_secs: None,
            tick_interval_ms: default_tick_interval_ms(),
            shell: None,
        }
    }
}

/// Where run reports go.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportingSection {
    /// Directory for persisted run reports; reports are not written when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
}

/// The complete conductor.toml configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub reporting: ReportingSection,
    /// Worker pool
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load `conductor.toml` from a directory.
    /// Returns default configuration if the file doesn't exist.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Starter configuration written by `conductor config init`.
    pub fn default_toml() -> String {
        format!(
            r#"# conductor configuration

[routing]
# round-robin | weighted | least-loaded | capability-match | affinity-hash
strategy = "{strategy}"
oversubscription_factor = {factor:.1}
phase_fatal_on_no_eligible_worker = false
deferred_task_timeout_secs = {deferred:.1}
score_decay = {decay}

[retry]
max_attempts = {attempts}
backoff_base_secs = {base:.1}
backoff_multiplier = {multiplier:.1}
jitter_secs = 0.0
critical_extra_attempt = true

# [retry.classes.flaky]
# max_attempts = 5

[execution]
# task_timeout_secs = 600.0
tick_interval_ms = {tick}
# shell = "sh"

[reporting]
# report_dir = ".conductor/runs"

[[workers]]
id = "local-1"
capabilities = ["shell"]
weight = 1.0
"#,
            strategy = Strategy::default(),
            factor = DEFAULT_OVERSUBSCRIPTION,
            deferred = default_deferred_task_timeout_secs(),
            decay = DEFAULT_SCORE_DECAY,
            attempts = default_max_attempts(),
            base = default_backoff_base_secs(),
            multiplier = default_backoff_multiplier(),
            tick = default_tick_interval_ms(),
        )
    }

    /// Apply `CONDUCTOR_STRATEGY` and `CONDUCTOR_MAX_ATTEMPTS` over file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("CONDUCTOR_STRATEGY") {
            self.routing.strategy = value
                .parse()
                .context("Invalid CONDUCTOR_STRATEGY")?;
        }
        if let Ok(value) = std::env::var("CONDUCTOR_MAX_ATTEMPTS") {
            self.retry.max_attempts = value
                .trim()
                .parse()
                .with_context(|| format!("Invalid CONDUCTOR_MAX_ATTEMPTS '{}'", value))?;
        }
        Ok(())
    }

    /// Build a registry with every configured worker registered.
    pub fn build_registry(&self) -> Result<Arc<CapacityRegistry>, RegistryError> {
        let registry = Arc::new(CapacityRegistry::new(
            self.routing.oversubscription_factor,
            self.routing.score_decay,
        ));
        for worker in &self.workers {
            registry.register(worker.clone())?;
        }
        Ok(registry)
    }

    /// Build a router over `registry` with the configured strategy.
    pub fn build_router(&self, registry: Arc<CapacityRegistry>) -> Router {
        let router = Router::new(registry, self.routing.strategy)
            .with_virtual_nodes(self.routing.virtual_nodes);
        match self.routing.seed {
            Some(seed) => router.with_seed(seed),
            None => router,
        }
    }

    /// Build the retry coordinator with the default and per-class policies.
    pub fn build_retry(&self) -> RetryCoordinator {
        let mut retry = RetryCoordinator::new(self.retry.policy())
            .with_critical_extra_attempt(self.retry.critical_extra_attempt);
        for (class, overrides) in &self.retry.classes {
            retry = retry.with_class(class, self.retry.class_policy(overrides));
        }
        match self.routing.seed {
            Some(seed) => retry.with_seed(seed),
            None => retry,
        }
    }

    /// Run loop settings.
    pub fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::default()
            .with_phase_fatal_on_no_eligible_worker(self.routing.phase_fatal_on_no_eligible_worker)
            .with_deferred_task_timeout(secs(self.routing.deferred_task_timeout_secs))
            .with_tick_interval(Duration::from_millis(self.execution.tick_interval_ms.max(1)));
        if let Some(timeout) = self.execution.task_timeout_secs {
            config = config.with_task_timeout(secs(timeout));
        }
        config
    }

    /// Shell command executor running in `working_dir`.
    pub fn build_command_executor(&self, working_dir: &Path) -> CommandExecutor {
        let executor = CommandExecutor::new().with_working_dir(working_dir.to_path_buf());
        match &self.execution.shell {
            Some(shell) => executor.with_shell(shell),
            None => executor,
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let routing = &self.routing;

        if routing.oversubscription_factor <= 0.0 {
            warnings.push(format!(
                "oversubscription_factor must be positive, got {}",
                routing.oversubscription_factor
            ));
        }
        if !(0.0..1.0).contains(&routing.score_decay) {
            warnings.push(format!(
                "score_decay should be in [0, 1), got {}",
                routing.score_decay
            ));
        }
        if routing.deferred_task_timeout_secs < 0.0 {
            warnings.push("deferred_task_timeout_secs must not be negative".to_string());
        }
        if routing.strategy == Strategy::AffinityHash && routing.virtual_nodes == 0 {
            warnings.push("affinity-hash strategy needs virtual_nodes > 0".to_string());
        }

        validate_retry(
            "[retry]",
            self.retry.max_attempts,
            self.retry.backoff_base_secs,
            self.retry.backoff_multiplier,
            self.retry.jitter_secs,
            &mut warnings,
        );
        for (class, o) in &self.retry.classes {
            validate_retry(
                &format!("[retry.classes.{class}]"),
                o.max_attempts.unwrap_or(self.retry.max_attempts),
                o.backoff_base_secs.unwrap_or(self.retry.backoff_base_secs),
                o.backoff_multiplier.unwrap_or(self.retry.backoff_multiplier),
                o.jitter_secs.unwrap_or(self.retry.jitter_secs),
                &mut warnings,
            );
        }

        if let Some(timeout) = self.execution.task_timeout_secs
            && timeout <= 0.0
        {
            warnings.push(format!("task_timeout_secs must be positive, got {timeout}"));
        }
        if self.execution.tick_interval_ms == 0 {
            warnings.push("tick_interval_ms of 0 is treated as 1".to_string());
        }
        if self
            .execution
            .shell
            .as_deref()
            .is_some_and(|shell| shell.trim().is_empty())
        {
            warnings.push("execution.shell is empty".to_string());
        }

        if self.workers.is_empty() {
            warnings.push("No workers configured; every task will wait for a worker".to_string());
        }
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.id.as_str()) {
                warnings.push(format!("Duplicate worker id '{}'", worker.id));
            }
            if worker.capabilities.is_empty() {
                warnings.push(format!("Worker '{}' has no capabilities", worker.id));
            }
            if (worker.weight * routing.oversubscription_factor + 1e-9).floor() < 1.0 {
                warnings.push(format!(
                    "Worker '{}' has weight {} which gives it no slots at oversubscription factor {}",
                    worker.id, worker.weight, routing.oversubscription_factor
                ));
            }
        }

        warnings
    }
}

fn validate_retry(
    section: &str,
    max_attempts: u32,
    base: f64,
    multiplier: f64,
    jitter: f64,
    warnings: &mut Vec<String>,
) {
    if max_attempts == 0 {
        warnings.push(format!("{section} max_attempts of 0 is treated as 1"));
    }
    if base < 0.0 {
        warnings.push(format!("{section} backoff_base_secs must not be negative"));
    }
    if multiplier < 1.0 {
        warnings.push(format!(
            "{section} backoff_multiplier {multiplier} is below 1.0; delays will shrink"
        ));
    }
    if jitter < 0.0 {
        warnings.push(format!("{section} jitter_secs must not be negative"));
    }
}
