//! Control-plane services: the budget ledger, the cell tree, the spawn
//! gate, and the resource controllers.

pub mod cell_tree;
pub mod checks;
pub mod config;
pub mod event_consumer;
pub mod evolution;
pub mod formation;
pub mod ledger;
pub mod mission;
pub mod reconciler;
pub mod recursion;
pub mod swarm;
pub mod topology;

pub use cell_tree::CellTreeStore;
pub use checks::CheckRunner;
pub use config::{Config, ConfigLoader};
pub use event_consumer::{EventConsumer, EventConsumerHandle};
pub use evolution::EvolutionController;
pub use formation::FormationController;
pub use ledger::BudgetLedger;
pub use mission::MissionController;
pub use reconciler::{Controller, ControllerHandle, ControllerOptions, Reconcile};
pub use recursion::RecursionValidator;
pub use swarm::{MetricRegistry, SwarmController};
