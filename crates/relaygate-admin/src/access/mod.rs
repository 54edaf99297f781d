//! Relay access policy: the managed relay process and whitelist propagation.

mod policy;
mod process;

pub use policy::{AccessSync, PolicyFile};
pub use process::{DetachedRelay, PidFileProcess, ProcessError, RelayProcess};
