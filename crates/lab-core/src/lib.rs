//! lab-core — shared building blocks for the labgrid crates.

pub mod clock;
pub mod config;
pub mod exec;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, epoch_secs};
pub use config::PlatformConfig;
pub use exec::{CommandOutput, CommandRunner, ExecError, RunFuture, TokioCommandRunner};
