//! Domain model types.

pub mod budget;
pub mod cell;
pub mod envelope;
pub mod event;
pub mod evolution;
pub mod formation;
pub mod mind;
pub mod mission;
pub mod resource;
pub mod spawn;
pub mod swarm;
pub mod tree;

pub use budget::{BudgetBalance, JournalEntry, JournalOp};
pub use cell::{Cell, CellBudget, CellPhase, CellSpec, CellStatus, MemorySpec, MindSelector, RecursionSpec, SpawnPolicy};
pub use envelope::{Envelope, EnvelopeType, TraceContext};
pub use event::{CellEvent, CellEventType};
pub use evolution::{
    CrossoverMethod, Evolution, EvolutionBudget, EvolutionPhase, EvolutionSpec, EvolutionStatus,
    GeneDomain, GeneSpec, GeneValue, Individual, MutationSpec, SelectionMethod,
};
pub use formation::{
    CellSummary, CellTemplate, Formation, FormationBudget, FormationPhase, FormationSpec,
    FormationStatus, Route, TopologyKind, TopologySpec,
};
pub use mind::{ChatMessage, ContentBlock, Role, StopReason, ThinkRequest, ThinkResponse, TokenUsage, ToolSpec};
pub use mission::{
    AttemptRecord, CheckResult, CheckSpec, CheckStatus, CmpOperator, CompletionSpec, Entrypoint,
    Mission, MissionBudget, MissionPhase, MissionSpec, MissionStatus, ReviewDecision, ReviewSpec,
    ReviewState,
};
pub use resource::{ObjectMeta, OwnerReference, Resource, API_VERSION};
pub use spawn::{SpawnDecision, SpawnInput, SpawnRequest, SpawnRequestStatus};
pub use swarm::{ScalingSpec, Swarm, SwarmBudget, SwarmPhase, SwarmSpec, SwarmStatus, TriggerSpec};
pub use tree::CellNode;
