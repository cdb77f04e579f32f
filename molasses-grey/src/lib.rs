//! The greylisting engine: the tuple/trap/white database and its
//! drivers, the firewall driver contract, and the two long-running tasks
//! (updater and scanner) the front-end cooperates with over the internal
//! pipes.

pub mod db;
pub mod firewall;
pub mod greylister;
pub mod scanner;
pub mod updater;

pub use db::{DbDriver, DbError, GreyData, GreyTuple, Key, SharedDb};
pub use firewall::{FwDriver, FwError};
pub use greylister::Greylister;
pub use scanner::Scanner;
pub use updater::{GreyTimes, Updater};
