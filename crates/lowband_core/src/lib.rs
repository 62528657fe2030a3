pub mod accountant;
pub mod classifier;
pub mod dedup;
pub mod error;
pub mod pipeline;

pub use accountant::{BandwidthAccountant, BandwidthSnapshot, Totals};
pub use classifier::{BlockReason, Decision, ResourcePolicy};
pub use dedup::{Deduplicator, FollowerTicket, LeaderTicket, Role, WaitError};
pub use error::PipelineError;
pub use pipeline::{Outcome, Pipeline, ProxyResponse};
