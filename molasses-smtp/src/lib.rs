//! The SMTP tarpit engine: a fixed table of connection slots, each
//! driven by one state machine and two time gates that together form
//! the output "stutter" scheduler.

pub mod connection;
pub mod state;
pub mod table;

pub use connection::{Connection, StateCtx};
pub use state::State;
pub use table::{ConnectionTable, Counts};
