//! Firewall driver contract and the bundled drivers.
//!
//! The scanner hands whole address sets to the firewall; the front-end
//! asks it for the pre-DNAT destination of a redirected connection.
//! Drivers are selected by name from the `[firewall]` config section.

use std::{
    collections::HashMap,
    io::Write as _,
    net::SocketAddr,
    path::PathBuf,
    process::{Command, Stdio},
    sync::{Arc, Mutex, PoisonError},
};

use thiserror::Error;

use molasses_common::config::FirewallConfig;
use molasses_net::Cidr;

#[derive(Debug, Error)]
pub enum FwError {
    #[error("firewall control I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("firewall control command exited with {0}")]
    CommandFailed(std::process::ExitStatus),

    #[error("unknown firewall driver {0:?}")]
    UnknownDriver(String),
}

pub trait FwDriver: Send {
    /// Replace the named address set with exactly the given cover.
    fn replace(&mut self, set_name: &str, cidrs: &[Cidr]) -> Result<(), FwError>;

    /// Recover the address a redirected client originally connected to.
    /// Without a NAT table to consult, the proxy address is the honest
    /// answer.
    fn lookup_orig_dst(&self, _peer: &SocketAddr, proxy: &SocketAddr) -> SocketAddr {
        *proxy
    }
}

pub fn open(config: &FirewallConfig) -> Result<Box<dyn FwDriver>, FwError> {
    match config.driver.as_str() {
        "dummy" => Ok(Box::new(DummyFw::default())),
        "pfctl" => Ok(Box::new(PfctlFw {
            pfctl_path: config
                .pfctl_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(PfctlFw::DEFAULT_PATH)),
        })),
        other => Err(FwError::UnknownDriver(other.to_owned())),
    }
}

/// Driver that only remembers what it was told; the test double the
/// driver contract requires.
#[derive(Debug, Clone, Default)]
pub struct DummyFw {
    sets: Arc<Mutex<HashMap<String, Vec<Cidr>>>>,
}

impl DummyFw {
    /// The last cover handed over for `set_name`, if any.
    pub fn set(&self, set_name: &str) -> Option<Vec<Cidr>> {
        self.sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(set_name)
            .cloned()
    }

    pub fn replacements(&self) -> usize {
        self.sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl FwDriver for DummyFw {
    fn replace(&mut self, set_name: &str, cidrs: &[Cidr]) -> Result<(), FwError> {
        self.sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(set_name.to_owned(), cidrs.to_vec());
        Ok(())
    }
}

/// Driver feeding PF tables through `pfctl -T replace -f -`.
pub struct PfctlFw {
    pfctl_path: PathBuf,
}

impl PfctlFw {
    pub const DEFAULT_PATH: &'static str = "/sbin/pfctl";
}

impl FwDriver for PfctlFw {
    fn replace(&mut self, set_name: &str, cidrs: &[Cidr]) -> Result<(), FwError> {
        let mut child = Command::new(&self.pfctl_path)
            .args(["-q", "-t", set_name, "-T", "replace", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        if let Some(stdin) = child.stdin.as_mut() {
            let mut feed = String::new();
            for cidr in cidrs {
                feed.push_str(&cidr.to_string());
                feed.push('\n');
            }
            stdin.write_all(feed.as_bytes())?;
        }

        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(FwError::CommandFailed(status))
        }
    }
}
