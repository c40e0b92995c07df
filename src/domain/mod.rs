pub mod command;
pub mod state;
pub mod topology;
pub mod types;

pub use command::*;
pub use state::*;
pub use topology::*;
pub use types::*;
