pub mod agent;
pub mod coordinator;
pub mod error;
pub mod manager;
pub mod sequence;

pub use agent::EventAgent;
pub use coordinator::{Coordinator, RecomputeOutcome, SweepReport};
pub use error::DaffodilError;
pub use manager::AgentManager;
pub use sequence::SequenceSource;
