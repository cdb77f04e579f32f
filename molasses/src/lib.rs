//! Daemon composition: the front-end event loop that owns the
//! connection table and cooperates with the greylisting tasks.

pub mod server;

pub use server::Server;
