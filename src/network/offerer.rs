//! Tie-break for simultaneous connection attempts.
//!
//! Both peers evaluate the same pair of hashes from opposite sides, so they
//! always agree on which one of them is the offerer. The hash is the first
//! four bytes of MD5 over `"a,b"`, read as a little-endian i32. This must not
//! change: peers running other implementations compute the same value.

use crate::types::PeerAddress;
use md5::{Digest, Md5};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offerer {
    Local,
    Remote,
}

/// Decide which side is allowed to dial when both could
pub fn offerer(local: &PeerAddress, remote: &PeerAddress) -> Offerer {
    let local_first = offering_hash(local, remote);
    let remote_first = offering_hash(remote, local);
    if local_first < remote_first {
        Offerer::Local
    } else {
        Offerer::Remote
    }
}

fn offering_hash(first: &PeerAddress, second: &PeerAddress) -> i32 {
    md5_prefix(format!("{},{}", first, second).as_bytes())
}

fn md5_prefix(data: &[u8]) -> i32 {
    let digest = Md5::digest(data);
    i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
