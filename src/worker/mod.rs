//! Local command execution shared by the master and the slaves.
//!
//! - [`CommandExecutor`]: bounded pool of `sh -c` subprocesses with FIFO
//!   overflow and start/finish observers
//! - [`outputs`]: output directory and response file preparation
//!
//! Commands run in the build's working directory. Output is captured as
//! stdout followed by stderr; a command killed by SIGINT, or stopped by
//! [`CommandExecutor::abort`], reports as interrupted rather than failed.

pub mod executor;
pub mod outputs;

pub use executor::{CommandExecutor, CommandObserver, CommandResult, FinishedCommand};
pub use outputs::{prepare_outputs, remove_rspfile};
