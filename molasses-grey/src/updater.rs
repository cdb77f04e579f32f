//! The updater: sole writer of the greylist database during normal
//! operation. It drains typed records from the grey pipe and applies
//! the greylisting policy to one key at a time.

use std::sync::PoisonError;

use tokio::{io::AsyncRead, sync::broadcast};

use molasses_common::{config::GreyConfig, internal, record::{Record, RecordReader}, unix_now, Signal};

use crate::db::{
    DbDriver, DbError, GreyData, GreyTuple, Key, SharedDb, PCOUNT_TRAPPED,
};

/// The four clocks greylisting runs on, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct GreyTimes {
    pub pass_time: i64,
    pub grey_expiry: i64,
    pub white_expiry: i64,
    pub trap_expiry: i64,
}

impl From<&GreyConfig> for GreyTimes {
    fn from(config: &GreyConfig) -> Self {
        Self {
            pass_time: config.pass_time,
            grey_expiry: config.grey_expiry,
            white_expiry: config.white_expiry,
            trap_expiry: config.trap_expiry,
        }
    }
}

pub struct Updater {
    db: SharedDb,
    times: GreyTimes,
    low_prio_mx: Option<String>,
}

impl Updater {
    pub fn new(db: SharedDb, times: GreyTimes, low_prio_mx: Option<String>) -> Self {
        Self {
            db,
            times,
            low_prio_mx,
        }
    }

    /// Apply one record at time `now`. Each call is one read-modify-write
    /// of the affected key(s).
    pub fn apply(&self, record: &Record, now: i64) -> Result<(), DbError> {
        let mut guard = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let db: &mut dyn DbDriver = &mut **guard;

        match record {
            Record::Grey {
                dst_ip,
                ip,
                helo,
                from,
                to,
            } => self.apply_grey(db, dst_ip, ip, helo, from, to, now)?,
            Record::White { ip, expires, .. } => apply_white(db, ip, *expires, now)?,
            Record::Trap { ip, expires, .. } => apply_trap(db, ip, *expires, now)?,
            Record::Config { name, .. } => {
                tracing::warn!("config record for {name:?} on the grey pipe, ignoring");
            }
        }

        guard.sync()
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_grey(
        &self,
        db: &mut dyn DbDriver,
        dst_ip: &str,
        ip: &str,
        helo: &str,
        from: &str,
        to: &str,
        now: i64,
    ) -> Result<(), DbError> {
        // Mailing a spamtrap address blacklists the source outright.
        if let Some(val) = db.get(&Key::Mail(to.to_owned()))? {
            if val.is_spamtrap() {
                return trap_source(db, ip, now + self.times.trap_expiry, now);
            }
        }

        // So does connecting straight to the low-priority MX.
        if self.low_prio_mx.as_deref() == Some(dst_ip) {
            return trap_source(db, ip, now + self.times.trap_expiry, now);
        }

        let key = Key::Tuple(GreyTuple {
            ip: ip.to_owned(),
            helo: helo.to_owned(),
            from: from.to_owned(),
            to: to.to_owned(),
        });

        match db.get(&key)? {
            None => db.put(
                key,
                GreyData {
                    first: now,
                    pass: now + self.times.pass_time,
                    expire: now + self.times.grey_expiry,
                    bcount: 1,
                    pcount: 0,
                },
            ),
            Some(mut tuple) => {
                tuple.bcount += 1;
                if now >= tuple.pass {
                    promote_to_white(db, ip, &tuple, now, now + self.times.white_expiry)?;
                    tuple.pcount += 1;
                }
                db.put(key, tuple)
            }
        }
    }

    /// Drain the grey pipe until it closes or shutdown is signalled.
    /// Database failures skip the record; the pipe going away is fatal
    /// for this task only.
    pub async fn run<R>(self, pipe: R, mut shutdown: broadcast::Receiver<Signal>)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut reader = RecordReader::new(pipe);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    internal!(level = DEBUG, "updater shutting down");
                    break;
                }

                record = reader.next_record() => match record {
                    Ok(Some(record)) => {
                        if let Err(err) = self.apply(&record, unix_now()) {
                            tracing::warn!("skipping {} record: {err}", record.type_tag());
                        }
                    }
                    Ok(None) => {
                        internal!(level = INFO, "grey pipe closed, updater exiting");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!("grey pipe read failed: {err}");
                        break;
                    }
                }
            }
        }
    }
}

/// Trap `ip` until `expire`. An existing row of any kind turns into a
/// trap; every hit restarts its first-seen time and grows its block
/// count.
fn trap_source(db: &mut dyn DbDriver, ip: &str, expire: i64, now: i64) -> Result<(), DbError> {
    let key = Key::Ip(ip.to_owned());
    let row = match db.get(&key)? {
        Some(mut existing) => {
            existing.pcount = PCOUNT_TRAPPED;
            existing.expire = expire;
            existing.first = now;
            existing.bcount += 1;
            existing
        }
        None => GreyData {
            first: now,
            pass: 0,
            expire,
            bcount: 1,
            pcount: PCOUNT_TRAPPED,
        },
    };
    db.put(key, row)
}

/// Whitelist `ip` off the back of a passed tuple. A trapped row wins
/// over the promotion; an existing white row has its lease extended.
pub(crate) fn promote_to_white(
    db: &mut dyn DbDriver,
    ip: &str,
    tuple: &GreyData,
    now: i64,
    expire: i64,
) -> Result<(), DbError> {
    let key = Key::Ip(ip.to_owned());
    match db.get(&key)? {
        Some(existing) if existing.is_trapped() => Ok(()),
        Some(mut existing) => {
            existing.pass = now;
            existing.expire = existing.expire.max(expire);
            db.put(key, existing)
        }
        None => db.put(
            key,
            GreyData {
                first: tuple.first,
                pass: now,
                expire,
                bcount: tuple.bcount,
                pcount: tuple.pcount,
            },
        ),
    }
}

/// Apply a `WHITE` record: a fresh row starts with clean counters, a
/// refresh keeps the longer lease and counts a pass.
fn apply_white(db: &mut dyn DbDriver, ip: &str, expires: i64, now: i64) -> Result<(), DbError> {
    let key = Key::Ip(ip.to_owned());
    match db.get(&key)? {
        Some(existing) if existing.is_trapped() => Ok(()),
        Some(mut existing) => {
            existing.expire = existing.expire.max(expires);
            existing.pcount += 1;
            db.put(key, existing)
        }
        None => db.put(
            key,
            GreyData {
                first: now,
                pass: now,
                expire: expires,
                bcount: 0,
                pcount: 0,
            },
        ),
    }
}

/// Apply a `TRAP` record: the lease is whatever the source said.
fn apply_trap(db: &mut dyn DbDriver, ip: &str, expires: i64, now: i64) -> Result<(), DbError> {
    let key = Key::Ip(ip.to_owned());
    let row = match db.get(&key)? {
        Some(mut existing) => {
            existing.pcount = PCOUNT_TRAPPED;
            existing.expire = expires;
            existing
        }
        None => GreyData {
            first: now,
            pass: 0,
            expire: expires,
            bcount: 0,
            pcount: PCOUNT_TRAPPED,
        },
    };
    db.put(key, row)
}
