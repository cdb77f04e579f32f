//! The front-end event loop.
//!
//! One task owns every connection slot. Each wakeup (an accepted
//! connection, a config push, or the sweep tick) walks the table and
//! lets any slot whose time gate has opened make its next non-blocking
//! read or write. Nothing in here ever waits on a single client.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use futures_util::future::join_all;
use tokio::{
    io::AsyncRead,
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use molasses_common::{
    config::Config,
    internal,
    record::{Record, RecordReader, RecordWriter},
    unix_now, Signal,
};
use molasses_grey::{
    firewall::{self, FwDriver},
    Greylister,
};
use molasses_net::{Blacklist, Kind};
use molasses_smtp::{ConnectionTable, StateCtx};

/// How often the slot sweep runs when nothing else wakes the loop.
/// Stutter gates are whole seconds, so a quarter of one is plenty.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

pub struct Server {
    config: Config,
    blacklists: Vec<Arc<Blacklist>>,
    fw: Box<dyn FwDriver>,
    listener: TcpListener,
    listener6: Option<TcpListener>,
    control: TcpListener,
}

enum Wake {
    Shutdown,
    Smtp(io::Result<(TcpStream, SocketAddr)>),
    Control(io::Result<(TcpStream, SocketAddr)>),
    Cfg(Option<Record>),
    Tick,
}

impl Server {
    /// Load the blacklists and drivers and bind the listeners. Any
    /// failure here is fatal: the daemon refuses to start half-made.
    pub async fn bind(config: Config) -> anyhow::Result<Self> {
        let blacklists = build_blacklists(&config)?;
        let fw = firewall::open(&config.firewall)?;

        let bind_ip = config
            .bind_address
            .map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V4);
        let listener = TcpListener::bind((bind_ip, config.port)).await?;

        let listener6 = if config.enable_ipv6 {
            let bind_ip6 = config.bind_address_ipv6.unwrap_or(Ipv6Addr::UNSPECIFIED);
            Some(TcpListener::bind((bind_ip6, config.port)).await?)
        } else {
            None
        };

        let control = TcpListener::bind((Ipv4Addr::LOCALHOST, config.config_port)).await?;

        internal!(
            level = INFO,
            "listening on {} ({} blacklists, control on {})",
            listener.local_addr()?,
            blacklists.len(),
            control.local_addr()?
        );

        Ok(Self {
            config,
            blacklists,
            fw,
            listener,
            listener6,
            control,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until a shutdown signal arrives on the broadcast channel.
    pub async fn run(mut self, shutdown: broadcast::Sender<Signal>) -> anyhow::Result<()> {
        let mut shutdown_rx = shutdown.subscribe();
        let mut table = ConnectionTable::new(self.config.max_cons);
        let mut pending: Vec<Record> = Vec::new();

        // Config records from the scanner and from control connections
        // funnel into one channel; a push replaces, so order between
        // sources does not matter.
        let (cfg_tx, mut cfg_rx) = mpsc::channel::<Record>(16);

        let mut grey_pipe = None;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        if self.config.grey.enable {
            let greylister = Greylister::spawn(&self.config, &shutdown)?;
            grey_pipe = Some(RecordWriter::new(greylister.grey_pipe));
            tokio::spawn(forward_records(
                RecordReader::new(greylister.config_pipe),
                cfg_tx.clone(),
            ));
            tasks.push(greylister.updater);
            tasks.push(greylister.scanner);
        }

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let wake = tokio::select! {
                _ = shutdown_rx.recv() => Wake::Shutdown,

                accepted = self.listener.accept() => Wake::Smtp(accepted),

                accepted = async {
                    match self.listener6.as_ref() {
                        Some(listener) => listener.accept().await,
                        None => std::future::pending().await,
                    }
                }, if self.listener6.is_some() => Wake::Smtp(accepted),

                accepted = self.control.accept() => Wake::Control(accepted),

                record = cfg_rx.recv() => Wake::Cfg(record),

                _ = sweep.tick() => Wake::Tick,
            };

            let now = unix_now();
            match wake {
                Wake::Shutdown => {
                    internal!(level = INFO, "shutdown signalled, closing connections");
                    break;
                }
                Wake::Smtp(accepted) => self.admit(accepted, &mut table, now),
                Wake::Control(accepted) => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("control connection from {peer}");
                        tokio::spawn(forward_records(RecordReader::new(stream), cfg_tx.clone()));
                    }
                    Err(err) => tracing::warn!("control accept failed: {err}"),
                },
                Wake::Cfg(Some(record)) => self.apply_config_push(record),
                Wake::Cfg(None) | Wake::Tick => {}
            }

            sweep_table(&self.config, &mut table, &mut pending, now);

            // Forward what the sweep captured to the updater. A dead
            // pipe stops greylisting but never stops the tarpit.
            let mut pipe_gone = false;
            if let Some(writer) = grey_pipe.as_mut() {
                for record in pending.drain(..) {
                    if let Err(err) = writer.write_record(&record).await {
                        tracing::warn!("grey pipe write failed, greylisting disabled: {err}");
                        pipe_gone = true;
                        break;
                    }
                }
            }
            if pipe_gone {
                grey_pipe = None;
            }
            pending.clear();
        }

        // Orderly close: drop every client, wave the children goodbye,
        // and give the updater its EOF.
        close_all(&mut table, unix_now());
        let _ = shutdown.send(Signal::Shutdown);
        drop(grey_pipe);
        join_all(tasks).await;

        internal!(level = INFO, "exiting");
        Ok(())
    }

    /// Seat an accepted connection in a free slot, or drop it on the
    /// floor when the table is full. Either way the loop keeps turning.
    fn admit(
        &self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        table: &mut ConnectionTable,
        now: i64,
    ) {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                return;
            }
        };

        let Some(index) = table.free_slot() else {
            internal!(level = WARN, "connection table full, dropping {peer}");
            return;
        };

        // Connections are DNAT'ed to us; ask the firewall which address
        // the client was actually aiming at.
        let dst_addr = stream.local_addr().map_or_else(
            |_| String::new(),
            |local| self.fw.lookup_orig_dst(&peer, &local).ip().to_string(),
        );

        tracing::debug!("connected {peer}");
        let ConnectionTable { slots, counts } = table;
        slots[index].init(
            Some(stream),
            peer,
            dst_addr,
            counts,
            &self.blacklists,
            &self.config,
            now,
        );
    }

    /// A scanner (or control) push atomically replaces the named
    /// blacklist with the supplied cover.
    fn apply_config_push(&mut self, record: Record) {
        let Record::Config { name, message, ips } = record else {
            tracing::warn!("non-config record on the config pipe, ignoring");
            return;
        };

        let mut list = Blacklist::new(&name, &message);
        for ip in &ips {
            if let Err(err) = list.add_cidr(ip, Kind::Black) {
                tracing::warn!("bad entry in pushed blacklist {name}: {err}");
            }
        }

        tracing::debug!("replacing blacklist {name} with {} networks", ips.len());
        let list = Arc::new(list);
        match self.blacklists.iter_mut().find(|have| have.name == name) {
            Some(existing) => *existing = list,
            None => self.blacklists.push(list),
        }
    }
}

/// Walk every occupied slot and let its open gates make progress.
fn sweep_table(
    config: &Config,
    table: &mut ConnectionTable,
    records: &mut Vec<Record>,
    now: i64,
) {
    let ConnectionTable { slots, counts } = table;

    for slot in slots.iter_mut() {
        if slot.is_free() {
            continue;
        }

        if slot.r_time != 0 && now >= slot.r_time {
            let mut ctx = StateCtx {
                counts: &mut *counts,
                config,
                records: &mut *records,
            };
            slot.handle_read(now, &mut ctx);
        }

        if slot.is_free() {
            continue;
        }

        if slot.w_time != 0 && now >= slot.w_time {
            let mut ctx = StateCtx {
                counts: &mut *counts,
                config,
                records: &mut *records,
            };
            slot.handle_write(now, &mut ctx);
        }
    }
}

fn close_all(table: &mut ConnectionTable, now: i64) {
    let ConnectionTable { slots, counts } = table;
    for slot in slots.iter_mut() {
        if !slot.is_free() {
            slot.close(counts, now);
        }
    }
}

/// Pump records from a pipe or control stream into the config channel
/// until either side goes away.
async fn forward_records<R>(mut reader: RecordReader<R>, tx: mpsc::Sender<Record>)
where
    R: AsyncRead + Unpin + Send,
{
    loop {
        match reader.next_record().await {
            Ok(Some(record)) => {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::warn!("config source read failed: {err}");
                break;
            }
        }
    }
}

/// Build the statically configured blacklists. A bad address here is a
/// configuration error, and those are fatal at startup.
fn build_blacklists(config: &Config) -> anyhow::Result<Vec<Arc<Blacklist>>> {
    let mut lists = Vec::with_capacity(config.blacklists.len());

    for declared in &config.blacklists {
        let mut list = Blacklist::new(&declared.name, &declared.message);
        for entry in &declared.addresses {
            match entry.strip_prefix('!') {
                Some(white) => list.add_cidr(white, Kind::White)?,
                None => list.add_cidr(entry, Kind::Black)?,
            }
        }
        lists.push(Arc::new(list));
    }

    Ok(lists)
}
