//! Address-range bookkeeping for the tarpit: CIDR arithmetic and the
//! blacklist registry with its overlap/whitelist collapse sweep.

pub mod blacklist;
pub mod cidr;

pub use blacklist::{Blacklist, Kind};
pub use cidr::{range_to_cidrs, Cidr, Cidr6};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("not a valid address or CIDR block: {0:?}")]
    InvalidCidr(String),

    #[error("prefix length {0} out of range")]
    InvalidPrefix(u8),
}
