//! Port traits decoupling the core from its external collaborators.

pub mod bus;
pub mod fitness;
pub mod mind;
pub mod store;
pub mod tool;

pub use bus::{Bus, Delivery, DurableSubscription, Subscription};
pub use fitness::{FitnessEvaluator, GeneHashEvaluator};
pub use mind::Mind;
pub use store::{ResourceStore, WatchEvent};
pub use tool::Tool;
