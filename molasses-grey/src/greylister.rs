//! Wiring for the greylisting engine.
//!
//! The updater and scanner run as spawned tasks joined to the front-end
//! by two one-way in-process pipes speaking the record framing. No
//! global state: whoever holds the broadcast sender can wind the whole
//! engine down, and every task listens for that on its own receiver.

use std::time::Duration;

use thiserror::Error;
use tokio::{
    io::DuplexStream,
    sync::broadcast,
    task::JoinHandle,
};

use molasses_common::{config::Config, Signal};

use crate::{
    db::{self, DbError},
    firewall::{self, FwError},
    scanner::Scanner,
    updater::{GreyTimes, Updater},
};

/// Pipe capacity. Records are small; this buys the front-end plenty of
/// slack before a stalled updater would back-pressure it.
const PIPE_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum GreyError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Fw(#[from] FwError),
}

/// Handles the front-end keeps after the engine is spawned: the write
/// end of the grey pipe, the read end of the config pipe, and the task
/// handles to join at shutdown.
pub struct Greylister {
    pub grey_pipe: DuplexStream,
    pub config_pipe: DuplexStream,
    pub updater: JoinHandle<()>,
    pub scanner: JoinHandle<()>,
}

impl Greylister {
    /// Open the shared database and firewall driver, spawn both tasks,
    /// and return the front-end's ends of the pipes.
    pub fn spawn(
        config: &Config,
        shutdown: &broadcast::Sender<Signal>,
    ) -> Result<Self, GreyError> {
        let db = db::open(&config.database)?;
        let fw = firewall::open(&config.firewall)?;

        let (grey_pipe, grey_in) = tokio::io::duplex(PIPE_SIZE);
        let (config_out, config_pipe) = tokio::io::duplex(PIPE_SIZE);

        let updater = Updater::new(
            db.clone(),
            GreyTimes::from(&config.grey),
            config.grey.low_prio_mx_ip.map(|ip| ip.to_string()),
        );

        let scanner = Scanner::new(
            db,
            fw,
            &config.grey.traplist_name,
            &config.grey.traplist_message,
            &config.firewall.whitelist_set,
            config.grey.white_expiry,
        );

        let updater = tokio::spawn(updater.run(grey_in, shutdown.subscribe()));
        let scanner = tokio::spawn(scanner.run(
            config_out,
            Duration::from_secs(config.grey.scan_interval.max(1)),
            shutdown.subscribe(),
        ));

        Ok(Self {
            grey_pipe,
            config_pipe,
            updater,
            scanner,
        })
    }
}
