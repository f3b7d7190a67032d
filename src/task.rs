//! Task descriptors and plan-file loading.
//!
//! This module provides:
//! - `Task` describing one unit of work and its routing/retry attributes
//! - `TaskStatus` and `Criticality`
//! - `PlanFile` for loading a task set from JSON or YAML

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Retry policy class used when a task does not name one.
pub const DEFAULT_TASK_CLASS: &str = "default";

/// Whether exhausting retries on a task halts its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Exhaustion fails the phase (after one extra attempt, if configured)
    #[default]
    Critical,
    /// Exhaustion abandons the task; the phase continues
    NonCritical,
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Criticality::Critical => write!(f, "critical"),
            Criticality::NonCritical => write!(f, "non_critical"),
        }
    }
}

/// Lifecycle of a task inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies or on its phase to start
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a worker
    Ready,
    /// A worker has been reserved
    Dispatched,
    /// The executor is working on it
    Running,
    Succeeded,
    /// Failed and will not be retried
    Failed,
    /// Gave up on a non-critical task
    Abandoned,
}

impl TaskStatus {
    /// Check if the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Abandoned)
    }

    /// Check if the task is occupying a worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }
}

/// A single unit of work.
///
/// `payload` is handed to the executor untouched; the engine never looks inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    /// Unique task id
    pub id: String,
    /// Capability tag a worker must advertise to run this task
    pub capability: String,
    /// Higher runs first when capacity is scarce
    #[serde(default)]
    pub priority: i32,
    /// Absolute deadline; attempts running past it fail with `DeadlineExceeded`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Ids of tasks that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub criticality: Criticality,
    /// Retry policy class
    #[serde(default = "default_class")]
    pub class: String,
    /// Grouping key for affinity-hash routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity_key: Option<String>,
    /// Per-attempt timeout in seconds, overriding the configured default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

fn default_class() -> String {
    DEFAULT_TASK_CLASS.to_string()
}

impl Task {
    /// Create a task with no dependencies and default attributes.
    pub fn new(id: &str, capability: &str) -> Self {
        Self {
            id: id.to_string(),
            capability: capability.to_string(),
            priority: 0,
            deadline: None,
            depends_on: Vec::new(),
            criticality: Criticality::default(),
            class: default_class(),
            affinity_key: None,
            timeout_secs: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.class = class.to_string();
        self
    }

    pub fn with_affinity(mut self, key: &str) -> Self {
        self.affinity_key = Some(key.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Per-attempt timeout, if the task declares one.
    ///
    /// Values too large for a `Duration` saturate to `Duration::MAX`.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    /// Key used for affinity routing; falls back to the task id.
    pub fn routing_key(&self) -> &str {
        self.affinity_key.as_deref().unwrap_or(&self.id)
    }
}

/// A task set as supplied by the task source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanFile {
    /// Optional human-readable plan name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub tasks: Vec<Task>,
}

impl PlanFile {
    /// Load a plan from a JSON or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            Self::parse_yaml(&content)
                .with_context(|| format!("Failed to parse plan YAML: {}", path.display()))
        } else {
            Self::parse_json(&content)
                .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))
        }
    }

    pub fn parse_json(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn parse_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Save the plan as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        Ok(())
    }

    /// Get a task by id.
    pub fn get_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
