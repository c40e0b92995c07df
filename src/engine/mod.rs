//! Power-flow engine contract.
//!
//! An engine owns a loaded topology plus pending setpoints. Only the scan
//! scheduler drives it: commands are applied between solves and `solve` is the
//! one operation that advances simulated time.

pub mod factory;
pub mod gauss_seidel;

pub use factory::{EngineConstructor, EngineKind, EngineRegistry};
pub use gauss_seidel::{GaussSeidelEngine, SolverOptions};

use std::time::Duration;

use crate::domain::{Command, GridState, NetworkTopology};
use crate::error::{CommandError, EngineError, SolveError};

#[cfg_attr(test, mockall::automock)]
pub trait Engine: Send {
    /// Identifier used in logs and events
    fn name(&self) -> &'static str;

    /// Replace the modelled network. Pending setpoints are discarded.
    fn load(&mut self, topology: &NetworkTopology) -> Result<(), EngineError>;

    /// Compute one steady-state step from the current setpoints.
    ///
    /// `elapsed` is the simulated time the step covers; storage charge is
    /// integrated over it.
    fn solve(&mut self, elapsed: Duration) -> Result<GridState, SolveError>;

    /// Change a setpoint; takes effect on the next `solve`
    fn apply(&mut self, command: &Command) -> Result<(), CommandError>;

    /// Last solved state, or the unsolved initial state
    fn current_state(&self) -> GridState;
}

/// Engine shared between the scan scheduler and topology reloads
pub type SharedEngine = std::sync::Arc<parking_lot::Mutex<Box<dyn Engine>>>;
