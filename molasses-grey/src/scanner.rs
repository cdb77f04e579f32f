//! The scanner: the periodic pass over the greylist database.
//!
//! Each tick it expires lapsed rows, promotes tuples whose pass time
//! has arrived, hands the firewall fresh trap and white address sets,
//! and pushes the traplist back to the front-end as a blacklist
//! replacement. A failed pass is retried on the next tick; the task
//! only exits on shutdown or when the config pipe is gone.

use std::{sync::PoisonError, time::Duration};

use thiserror::Error;
use tokio::{io::AsyncWrite, sync::broadcast};

use molasses_common::{
    internal,
    record::{Record, RecordWriter},
    unix_now, Signal,
};
use molasses_net::{Blacklist, Kind};

use crate::{
    db::{DbDriver, DbError, Key, SharedDb},
    firewall::{FwDriver, FwError},
    updater::promote_to_white,
};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Fw(#[from] FwError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub expired: usize,
    pub promoted: usize,
}

pub struct Scanner {
    db: SharedDb,
    fw: Box<dyn FwDriver>,
    traplist_name: String,
    traplist_message: String,
    whitelist_set: String,
    white_expiry: i64,
}

impl Scanner {
    pub fn new(
        db: SharedDb,
        fw: Box<dyn FwDriver>,
        traplist_name: &str,
        traplist_message: &str,
        whitelist_set: &str,
        white_expiry: i64,
    ) -> Self {
        Self {
            db,
            fw,
            traplist_name: traplist_name.to_owned(),
            traplist_message: traplist_message.to_owned(),
            whitelist_set: whitelist_set.to_owned(),
            white_expiry,
        }
    }

    /// One pass at time `now`. Returns the traplist config record to
    /// push to the front-end.
    pub fn scan(&mut self, now: i64) -> Result<(Record, ScanStats), ScanError> {
        let mut trap_cover = Blacklist::new(&self.traplist_name, &self.traplist_message);
        let mut white_cover = Blacklist::new(&self.whitelist_set, "");
        let mut stats = ScanStats::default();

        {
            let mut guard = self.db.lock().unwrap_or_else(PoisonError::into_inner);
            let db: &mut dyn DbDriver = &mut **guard;

            for (key, val) in db.entries()? {
                if val.expired(now) {
                    db.del(&key)?;
                    stats.expired += 1;
                    continue;
                }

                match &key {
                    Key::Ip(ip) => {
                        let cover = if val.is_trapped() {
                            // Belt and braces: a lease ending this very
                            // second must not reach the firewall.
                            if val.expire <= now {
                                continue;
                            }
                            &mut trap_cover
                        } else if val.is_spamtrap() {
                            continue;
                        } else {
                            &mut white_cover
                        };

                        if let Err(err) = cover.add_cidr(ip, Kind::Black) {
                            tracing::warn!("unusable address in database: {err}");
                        }
                    }
                    Key::Tuple(tuple) => {
                        if val.pass <= now {
                            promote_to_white(db, &tuple.ip, &val, now, now + self.white_expiry)?;
                            stats.promoted += 1;
                            if let Err(err) = white_cover.add_cidr(&tuple.ip, Kind::Black) {
                                tracing::warn!("unusable address in database: {err}");
                            }
                        }
                    }
                    Key::Mail(_) => {}
                }
            }

            guard.sync()?;
        }

        let trap_cidrs = trap_cover.collapse();
        self.fw.replace(&self.traplist_name, &trap_cidrs)?;
        self.fw.replace(&self.whitelist_set, &white_cover.collapse())?;

        let record = Record::Config {
            name: self.traplist_name.clone(),
            message: self.traplist_message.clone(),
            ips: trap_cidrs.iter().map(ToString::to_string).collect(),
        };

        Ok((record, stats))
    }

    /// Scan on every tick until shutdown. The first tick fires
    /// immediately, so the front-end starts with a current traplist.
    pub async fn run<W>(
        mut self,
        pipe: W,
        interval: Duration,
        mut shutdown: broadcast::Receiver<Signal>,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        let mut writer = RecordWriter::new(pipe);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!(level = DEBUG, "scanner shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    let now = unix_now();
                    match self.scan(now) {
                        Ok((record, stats)) => {
                            tracing::debug!(
                                "scan expired {} rows, promoted {}",
                                stats.expired,
                                stats.promoted
                            );
                            if let Err(err) = writer.write_record(&record).await {
                                tracing::warn!("config pipe write failed: {err}");
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::warn!("scan failed, will retry next tick: {err}");
                        }
                    }
                }
            }
        }
    }
}
