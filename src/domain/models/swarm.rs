//! The Swarm resource: an autoscaled fleet of identical cells.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cell::CellSpec;
use super::resource::{impl_resource, ObjectMeta};

/// Signal the autoscaler reacts to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Depth of a bus subject's backlog.
    #[serde(rename_all = "camelCase")]
    QueueDepth {
        subject: String,
        scale_above: f64,
        scale_below: f64,
    },

    /// Last-known value of an externally reported metric.
    #[serde(rename_all = "camelCase")]
    Metric {
        name: String,
        scale_above: f64,
        scale_below: f64,
    },

    /// Cron-like minute pattern; match scales to max, non-match to min.
    #[serde(rename_all = "camelCase")]
    Schedule { pattern: String },

    /// Cost/throughput ratio.
    #[serde(rename_all = "camelCase")]
    BudgetEfficiency {
        scale_above: f64,
        scale_below: f64,
    },
}

fn default_step() -> u32 {
    1
}

fn default_cooldown() -> u64 {
    60
}

fn default_stabilization() -> u64 {
    30
}

fn default_grace_period() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScalingSpec {
    pub step: u32,
    pub cooldown_seconds: u64,
    pub stabilization_seconds: u64,
    pub grace_period_seconds: u64,
}

impl Default for ScalingSpec {
    fn default() -> Self {
        Self {
            step: default_step(),
            cooldown_seconds: default_cooldown(),
            stabilization_seconds: default_stabilization(),
            grace_period_seconds: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmBudget {
    pub max_cost_per_hour: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmSpec {
    pub cell_template: CellSpec,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub scaling: ScalingSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<SwarmBudget>,
    #[serde(default)]
    pub suspended: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SwarmPhase {
    #[default]
    Active,
    Suspended,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SwarmStatus {
    pub phase: SwarmPhase,
    pub current_replicas: u32,
    pub desired_replicas: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trigger_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The Swarm resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swarm {
    #[serde(default = "super::resource::api_version_default")]
    pub api_version: String,
    #[serde(default = "Swarm::kind_default")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: SwarmSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SwarmStatus>,
}

impl Swarm {
    fn kind_default() -> String {
        "Swarm".to_string()
    }

    pub fn new(metadata: ObjectMeta, spec: SwarmSpec) -> Self {
        Self {
            api_version: super::resource::API_VERSION.to_string(),
            kind: Self::kind_default(),
            metadata,
            spec,
            status: None,
        }
    }
}

impl_resource!(Swarm, "Swarm");
