use std::{
    net::{Ipv4Addr, Ipv6Addr},
    path::PathBuf,
};

use clap::Parser;
use tokio::sync::broadcast;

use molasses::Server;
use molasses_common::{config::Config, internal, logging, Signal};

/// An SMTP tarpit and greylisting daemon.
#[derive(Debug, Parser)]
#[command(name = "molasses", version, about)]
struct Args {
    /// Configuration file
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Port to listen for SMTP connections on
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// IPv4 address to bind
    #[arg(short = 'l', long)]
    bind_address: Option<Ipv4Addr>,

    /// IPv6 address to bind
    #[arg(short = 'L', long)]
    bind_address_ipv6: Option<Ipv6Addr>,

    /// Also listen on IPv6
    #[arg(short = '6', long)]
    enable_ipv6: bool,

    /// Hostname to announce in the banner
    #[arg(long)]
    hostname: Option<String>,

    /// Extra banner text
    #[arg(short = 'n', long)]
    banner: Option<String>,

    /// Per-byte stutter delay in seconds
    #[arg(short = 's', long)]
    stutter: Option<u64>,

    /// Seconds of stutter applied to greylisted clients
    #[arg(short = 'S', long)]
    grey_stutter: Option<u64>,

    /// Maximum concurrent connections
    #[arg(short = 'c', long)]
    max_cons: Option<usize>,

    /// Maximum concurrent stuttered (blacklisted) connections
    #[arg(short = 'B', long)]
    max_black: Option<usize>,

    /// Receive-window clamp during DATA, in bytes
    #[arg(short = 'w', long)]
    window: Option<u32>,

    /// Disable greylisting: blacklist-driven tarpitting only
    #[arg(short = 'b', long)]
    no_grey: bool,

    /// Reject blacklisted clients with 450 (the default)
    #[arg(short = '4', overrides_with = "permanent_error")]
    temporary_error: bool,

    /// Reject blacklisted clients with 550
    #[arg(short = '5', long = "permanent-error")]
    permanent_error: bool,

    /// Log every captured MAIL/RCPT pair
    #[arg(short = 'v', long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.bind_address {
            config.bind_address = Some(addr);
        }
        if let Some(addr) = self.bind_address_ipv6 {
            config.bind_address_ipv6 = Some(addr);
        }
        if self.enable_ipv6 {
            config.enable_ipv6 = true;
        }
        if let Some(hostname) = &self.hostname {
            config.hostname.clone_from(hostname);
        }
        if let Some(banner) = &self.banner {
            config.banner.clone_from(banner);
        }
        if let Some(stutter) = self.stutter {
            config.stutter = stutter;
        }
        if let Some(grey_stutter) = self.grey_stutter {
            config.grey.stutter = grey_stutter;
        }
        if let Some(max_cons) = self.max_cons {
            config.max_cons = max_cons;
        }
        if let Some(max_black) = self.max_black {
            config.max_black = max_black;
        }
        if let Some(window) = self.window {
            config.window = window;
        }
        if self.no_grey {
            config.grey.enable = false;
        }
        if self.permanent_error {
            config.error_code = String::from("550");
        } else if self.temporary_error {
            config.error_code = String::from("450");
        }
        if self.verbose {
            config.verbose = true;
        }

        config
    }
}

/// Lift the descriptor budget to cover the table plus bookkeeping. Not
/// being allowed to is survivable; running out mid-flight is handled by
/// dropping the affected connection.
fn raise_fd_limit(limit: u64) {
    let rlim = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if ret != 0 {
        tracing::warn!(
            "unable to raise RLIMIT_NOFILE to {limit}: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let config = args.apply(config).validate()?;

    logging::init(config.verbose);
    raise_fd_limit(config.max_cons as u64 + 15);

    let (shutdown, _) = broadcast::channel(8);
    tokio::spawn(watch_signals(shutdown.clone()));

    let server = Server::bind(config).await?;
    server.run(shutdown).await
}

/// SIGTERM, SIGINT and SIGHUP all fan out the same orderly shutdown.
async fn watch_signals(shutdown: broadcast::Sender<Signal>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut term) = signal(SignalKind::terminate()) else {
        return;
    };
    let Ok(mut int) = signal(SignalKind::interrupt()) else {
        return;
    };
    let Ok(mut hup) = signal(SignalKind::hangup()) else {
        return;
    };

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
        _ = hup.recv() => {}
    }

    internal!(level = INFO, "termination signal received");
    let _ = shutdown.send(Signal::Shutdown);
}
