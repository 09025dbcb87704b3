//! The Mission resource: a declarative objective evaluated by completion
//! checks with retry, timeout and optional human review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resource::{impl_resource, ObjectMeta};

/// Where the objective message is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entrypoint {
    /// Target cell name.
    pub cell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The instruction sent to the cell's inbox on each attempt.
    pub message: String,
}

/// Comparison operator for coverage checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CmpOperator {
    pub fn evaluate(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => (left - right).abs() < f64::EPSILON,
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
        }
    }
}

fn default_nats_timeout() -> u64 {
    30
}

/// One completion check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CheckSpec {
    /// All `paths` exist inside the mission workspace.
    #[serde(rename_all = "camelCase")]
    FileExists { name: String, paths: Vec<String> },

    /// Run a shell command in the workspace and match its output.
    #[serde(rename_all = "camelCase")]
    Command {
        name: String,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success_pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fail_pattern: Option<String>,
    },

    /// Run a command, parse stdout as JSON, compare a dot-path value.
    #[serde(rename_all = "camelCase")]
    Coverage {
        name: String,
        command: String,
        json_path: String,
        operator: CmpOperator,
        value: f64,
    },

    /// Inspect retained bus messages on a subject.
    #[serde(rename_all = "camelCase")]
    NatsResponse {
        name: String,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        success_pattern: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fail_pattern: Option<String>,
        #[serde(default = "default_nats_timeout")]
        timeout_seconds: u64,
    },
}

impl CheckSpec {
    pub fn name(&self) -> &str {
        match self {
            Self::FileExists { name, .. }
            | Self::Command { name, .. }
            | Self::Coverage { name, .. }
            | Self::NatsResponse { name, .. } => name,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionSpec {
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt timeout as a duration string, e.g. `"30m"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl Default for CompletionSpec {
    fn default() -> Self {
        Self {
            checks: Vec::new(),
            max_attempts: default_max_attempts(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionBudget {
    pub max_cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewSpec {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionSpec {
    pub entrypoint: Entrypoint,
    #[serde(default)]
    pub completion: CompletionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<MissionBudget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewSpec>,
    /// Root directory completion checks resolve paths and run commands in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
}

impl MissionSpec {
    pub fn review_enabled(&self) -> bool {
        self.review.is_some_and(|r| r.enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MissionPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl MissionPhase {
    /// Terminal phases emit no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for MissionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckStatus {
    #[default]
    Pending,
    Passed,
    Failed,
    /// The check could not be evaluated (bad config, parse failure).
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReviewDecision {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ReviewState {
    pub status: ReviewDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Record of one completed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MissionStatus {
    pub phase: MissionPhase,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<CheckResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<AttemptRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The Mission resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    #[serde(default = "super::resource::api_version_default")]
    pub api_version: String,
    #[serde(default = "Mission::kind_default")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: MissionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MissionStatus>,
}

impl Mission {
    fn kind_default() -> String {
        "Mission".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: MissionSpec) -> Self {
        Self {
            api_version: super::resource::API_VERSION.to_string(),
            kind: Self::kind_default(),
            metadata,
            spec,
            status: None,
        }
    }
}

impl_resource!(Mission, "Mission");

/// Parse a duration string with `s`/`m`/`h` units ("30m", "90s", "2h").
/// Bare numbers are seconds.
pub fn parse_duration(input: &str) -> Option<std::time::Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let (digits, unit) = match input.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = digits.parse().ok()?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => return None,
    };
    Some(std::time::Duration::from_secs(secs))
}
