//! Daemon configuration.
//!
//! The whole surface is one `Config` deserialised from a TOML file, with
//! nested sections for the greylisting engine, the database driver, the
//! firewall driver, and any statically declared blacklists. Every field
//! has a default, so an empty file yields a runnable tarpit-only daemon.

use std::{
    ffi::CStr,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::Deserialize;

use crate::error::ConfigError;

/// Default per-byte stutter delay, in seconds.
pub const STUTTER: u64 = 1;
/// Seconds a greylisted connection is stuttered before being let through
/// at full speed.
pub const GREY_STUTTER: u64 = 10;
/// Default cap on concurrent connections and on stuttered black clients.
pub const DEFAULT_MAX: usize = 800;
/// Pass a grey tuple once a retry arrives this many seconds after first
/// contact.
pub const PASSTIME: i64 = 60 * 25;
/// Remove grey tuples after this many seconds.
pub const GREYEXP: i64 = 60 * 60 * 4;
/// Remove whitelisted addresses after this many seconds.
pub const WHITEEXP: i64 = 60 * 60 * 24 * 36;
/// Hitting a spamtrap blacklists the source for this many seconds.
pub const TRAPEXP: i64 = 60 * 60 * 24;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Hostname announced in the SMTP banner and command replies.
    pub hostname: String,
    /// Extra banner text after the `ESMTP` tag.
    pub banner: String,
    pub port: u16,
    /// Loopback control port the scanner's config records arrive on when
    /// the greylister runs out of process.
    pub config_port: u16,
    pub bind_address: Option<Ipv4Addr>,
    pub bind_address_ipv6: Option<Ipv6Addr>,
    pub enable_ipv6: bool,
    /// Per-byte write delay in seconds for tarpitted connections.
    pub stutter: u64,
    /// `SO_RCVBUF` clamp applied when a client enters DATA; 0 leaves the
    /// socket alone.
    pub window: u32,
    /// Reply code family used for blacklist rejections ("450" or "550").
    pub error_code: String,
    pub max_cons: usize,
    pub max_black: usize,
    pub verbose: bool,
    pub grey: GreyConfig,
    pub database: DatabaseConfig,
    pub firewall: FirewallConfig,
    #[serde(rename = "blacklist")]
    pub blacklists: Vec<BlacklistConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GreyConfig {
    pub enable: bool,
    /// Seconds of stutter applied to unknown (non-blacklisted) clients.
    pub stutter: u64,
    pub pass_time: i64,
    pub grey_expiry: i64,
    pub white_expiry: i64,
    pub trap_expiry: i64,
    /// Seconds between scanner passes over the database.
    pub scan_interval: u64,
    /// Name of the blacklist (and firewall set) fed by spamtrap hits.
    pub traplist_name: String,
    /// Reject message for trapped clients; `%A` expands to the peer address.
    pub traplist_message: String,
    /// Clients connecting straight to this low-priority MX address are
    /// trapped without ever being greylisted.
    pub low_prio_mx_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Database driver name: `memory` or `file`.
    pub driver: String,
    /// On-disk location for drivers that persist.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirewallConfig {
    /// Firewall driver name: `dummy` or `pfctl`.
    pub driver: String,
    /// Address set replaced with the whitelist cover on each scan.
    pub whitelist_set: String,
    /// Override for the control program path (pfctl driver).
    pub pfctl_path: Option<PathBuf>,
}

/// A statically configured blacklist. Entries are CIDR strings; prefixing
/// an entry with `!` subtracts it (a whitelist hole) from this list.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlacklistConfig {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: system_hostname(),
            banner: String::new(),
            port: 25,
            config_port: 8026,
            bind_address: None,
            bind_address_ipv6: None,
            enable_ipv6: false,
            stutter: STUTTER,
            window: 0,
            error_code: String::from("450"),
            max_cons: DEFAULT_MAX,
            max_black: DEFAULT_MAX,
            verbose: false,
            grey: GreyConfig::default(),
            database: DatabaseConfig::default(),
            firewall: FirewallConfig::default(),
            blacklists: Vec::new(),
        }
    }
}

impl Default for GreyConfig {
    fn default() -> Self {
        Self {
            enable: true,
            stutter: GREY_STUTTER,
            pass_time: PASSTIME,
            grey_expiry: GREYEXP,
            white_expiry: WHITEEXP,
            trap_expiry: TRAPEXP,
            scan_interval: 60,
            traplist_name: String::from("molasses-greytrap"),
            traplist_message: String::from(
                "Your address %A has mailed to spamtraps here\\n",
            ),
            low_prio_mx_ip: None,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: String::from("memory"),
            path: None,
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            driver: String::from("dummy"),
            whitelist_set: String::from("molasses-whitelist"),
            pfctl_path: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        std::fs::read_to_string(path)?.parse()
    }

    /// Apply the cross-field rules that cannot be expressed per field:
    /// with greylisting off every connection may be stuttered, and the
    /// black-client cap can never exceed the connection cap.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if !self.grey.enable {
            self.max_black = self.max_cons;
        } else if self.max_black > self.max_cons {
            return Err(ConfigError::Invalid {
                field: "max_black",
                reason: format!(
                    "{} exceeds max_cons of {}",
                    self.max_black, self.max_cons
                ),
            });
        }

        if self.error_code.len() != 3 || !self.error_code.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::Invalid {
                field: "error_code",
                reason: format!("{:?} is not a 3-digit SMTP code", self.error_code),
            });
        }

        Ok(self)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

fn system_hostname() -> String {
    let mut buf = [0_u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len() - 1) };
    if ret == 0 {
        CStr::from_bytes_until_nul(&buf)
            .ok()
            .and_then(|name| name.to_str().ok())
            .map_or_else(|| String::from("localhost"), str::to_owned)
    } else {
        String::from("localhost")
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_runnable() {
        let config: Config = "".parse().unwrap();
        let config = config.validate().unwrap();

        assert_eq!(config.port, 25);
        assert_eq!(config.stutter, STUTTER);
        assert_eq!(config.error_code, "450");
        assert!(config.grey.enable);
        assert_eq!(config.grey.pass_time, PASSTIME);
        assert_eq!(config.database.driver, "memory");
        assert_eq!(config.firewall.driver, "dummy");
        assert!(config.blacklists.is_empty());
    }

    #[test]
    fn sections_and_blacklists_parse() {
        let config: Config = r#"
            hostname = "mx.example.org"
            banner = "IP-based SPAM blocker"
            stutter = 3

            [grey]
            enable = true
            traplist_name = "test traplist"
            traplist_message = "you have been trapped"
            grey_expiry = 3600
            low_prio_mx_ip = "192.179.21.3"

            [database]
            driver = "file"
            path = "/var/db/molasses.db"

            [firewall]
            driver = "pfctl"

            [[blacklist]]
            name = "uatraps"
            message = "Your address %A has sent mail to a ua.net spamtrap"
            addresses = ["10.0.0.0/8", "!10.1.0.0/16"]
        "#
        .parse()
        .unwrap();

        assert_eq!(config.hostname, "mx.example.org");
        assert_eq!(config.stutter, 3);
        assert_eq!(config.grey.grey_expiry, 3600);
        assert_eq!(
            config.grey.low_prio_mx_ip,
            Some(Ipv4Addr::new(192, 179, 21, 3))
        );
        assert_eq!(config.database.path.as_deref().unwrap().to_str().unwrap(), "/var/db/molasses.db");
        assert_eq!(config.blacklists.len(), 1);
        assert_eq!(config.blacklists[0].addresses.len(), 2);
    }

    #[test]
    fn disabling_grey_lifts_black_cap() {
        let config: Config = "max_cons = 200\nmax_black = 100\n[grey]\nenable = false"
            .parse()
            .unwrap();
        let config = config.validate().unwrap();
        assert_eq!(config.max_black, 200);
    }

    #[test]
    fn black_cap_above_connection_cap_is_rejected() {
        let config: Config = "max_cons = 100\nmax_black = 200".parse().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_black", .. })
        ));
    }

    #[test]
    fn unknown_keys_are_fatal() {
        assert!("not_an_option = 1".parse::<Config>().is_err());
    }
}
