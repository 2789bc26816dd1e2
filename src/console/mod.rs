//! Recovery console core types and CLI.

mod core;

pub mod cli;

pub use cli::run;
pub use core::{lock_state, ClearOutcome, LockState, RecoveryConsole, StaffId};
