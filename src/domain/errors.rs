//! Domain error types for the mitos platform.
//!
//! Each enum covers one concern. The `is_transient` classifiers drive retry
//! decisions in the reconciler and the cell runtime: transient errors are
//! retried with backoff, permanent errors surface to the resource status or
//! the HTTP caller.

use thiserror::Error;

/// Errors raised by the hierarchical budget ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The referenced cell has no balance row.
    #[error("no budget record for cell '{0}'")]
    NoBudgetRecord(String),

    /// A delegation was requested for more than the parent has available.
    #[error("Insufficient budget: cell '{cell_id}' has {available:.4} available, {required:.4} required")]
    InsufficientBudget {
        cell_id: String,
        required: f64,
        available: f64,
    },

    /// A spend was requested for more than the cell has available.
    #[error("Budget exhausted: cell '{cell_id}' has {available:.4} available, {required:.4} required")]
    BudgetExhausted {
        cell_id: String,
        required: f64,
        available: f64,
    },

    /// Amounts must be strictly positive.
    #[error("invalid amount {0}: must be > 0")]
    InvalidAmount(f64),

    #[error("ledger query failed: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    /// Database failures may succeed on retry; budget refusals never do.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

/// Errors raised by the cell ancestry tree.
#[derive(Error, Debug)]
pub enum TreeError {
    #[error("cell '{0}' not found in tree")]
    NotFound(String),

    #[error("cell '{0}' already registered in tree")]
    AlreadyExists(String),

    #[error("parent cell '{0}' not found in tree")]
    ParentNotFound(String),

    #[error("tree query failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised by a `Mind` (LLM provider) adapter.
#[derive(Error, Debug)]
pub enum MindError {
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("provider error {status}: {message}")]
    Api { status: u16, message: String },
}

impl MindError {
    /// Rate limits, network failures, timeouts and 5xx responses are
    /// recoverable; auth and malformed-response failures are not.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Network(_) | Self::Timeout(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Auth(_) | Self::InvalidResponse(_) => false,
        }
    }
}

/// Errors raised by the messaging bus.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,

    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),
}

/// Errors raised by the resource store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} '{namespace}/{name}' not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("{kind} '{namespace}/{name}' already exists")]
    AlreadyExists {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("invalid resource: {0}")]
    Invalid(String),
}

/// Errors raised while running a tool call inside the cell runtime.
#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid input for tool '{tool}': {reason}")]
    InvalidInput { tool: String, reason: String },

    #[error("tool '{tool}' failed: {reason}")]
    Failed { tool: String, reason: String },

    #[error("destination '{0}' is not reachable from this cell")]
    DestinationNotRouted(String),
}

/// Errors raised while evaluating a mission completion check.
///
/// A check error yields `CheckStatus::Error`, never `Failed`: it means the
/// check could not be evaluated, not that the objective is unmet.
#[derive(Error, Debug)]
pub enum CheckError {
    #[error("path traversal blocked: {0}")]
    PathTraversal(String),

    #[error("command could not be run: {0}")]
    CommandFailed(String),

    #[error("output is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("JSON path '{0}' not found in output")]
    JsonPathNotFound(String),

    #[error("value at '{path}' is not numeric: {value}")]
    NotNumeric { path: String, value: String },

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("bus read failed: {0}")]
    Bus(#[from] BusError),
}

/// Errors raised by the evolution controller.
#[derive(Error, Debug)]
pub enum EvolutionError {
    #[error("gene '{0}' has no values to pick from")]
    EmptyGene(String),

    #[error("population is empty")]
    EmptyPopulation,

    #[error("fitness evaluation failed: {0}")]
    EvaluationFailed(String),
}

/// Error wrapper used by reconcile loops.
///
/// Transient failures are retried with exponential backoff; terminal
/// failures are written to the resource status after retries exhaust.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("transient: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("terminal: {0}")]
    Terminal(#[source] anyhow::Error),
}

impl ReconcileError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        Self::Terminal(err.into())
    }

    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
