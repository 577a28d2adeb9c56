// Library interface for universal variables
// The binaries, integration tests and benchmarks all go through this crate

pub mod config;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod store;
pub mod universal;

pub use config::{SyncMode, UvarConfig};
pub use error::{Result, UvarError};
pub use store::{ChangeCallback, Variable, VariableStore};
pub use universal::UniversalVars;
