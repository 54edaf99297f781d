//! Content retention: age-based pruning and NIP-09 deletion requests.
//!
//! A daily pass first honors pending deletion requests (only for events the
//! requester actually authored), then removes events older than the policy
//! cutoff. Events matching an exception rule and events by the operator are
//! never pruned by age.

mod engine;

pub use engine::{RetentionEngine, RetentionReport};
