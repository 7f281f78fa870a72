// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Wire encoding of the out-of-band control channel records.

use std::fmt::{self, Display};

/// Length of an encoded [`RegionInfo`] record: eight hex digits for the
/// remote key, a colon, and sixteen hex digits for the buffer address.
pub const RECORD_LEN: usize = 25;

/// Length of a control signal.
pub const SIGNAL_LEN: usize = 5;

/// Sent once the measuring side is ready to count incoming operations.
pub const START_SIGNAL: &[u8; SIGNAL_LEN] = b"start";

/// Sent by the active side after its last one-sided operation completed.
pub const CLOSE_SIGNAL: &[u8; SIGNAL_LEN] = b"close";

/// Remote access parameters for a registered buffer, exchanged over the
/// control channel before a run starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    /// Remote access key of the registered region.
    pub rkey: u32,
    /// Starting address of the registered region.
    pub addr: u64,
}

impl RegionInfo {
    /// Encode as the fixed-width ASCII record `rrrrrrrr:aaaaaaaaaaaaaaaa`.
    #[must_use]
    pub fn encode(self) -> [u8; RECORD_LEN] {
        let mut buf = [0; RECORD_LEN];
        let s = format!("{:08x}:{:016x}", self.rkey, self.addr);
        buf.copy_from_slice(s.as_bytes());
        buf
    }

    /// Decode a received record. Returns `None` if the record is not
    /// exactly [`RECORD_LEN`] bytes of well-formed lowercase hex.
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != RECORD_LEN || buf[8] != b':' {
            return None;
        }
        let (key, addr) = (&buf[..8], &buf[9..]);
        // from_str_radix tolerates a sign prefix, so a "+" would slip
        // through the length check; insist on hex digits only.
        if !key.iter().chain(addr).all(u8::is_ascii_hexdigit) {
            return None;
        }
        let as_str = |b| std::str::from_utf8(b).ok();
        let rkey = u32::from_str_radix(as_str(key)?, 16).ok()?;
        let addr = u64::from_str_radix(as_str(addr)?, 16).ok()?;
        Some(Self { rkey, addr })
    }
}

impl Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}:{:016x}", self.rkey, self.addr)
    }
}
