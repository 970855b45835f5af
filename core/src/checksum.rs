// Copyright (C) 2019  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Internet checksum, as described in [RFC1071](https://tools.ietf.org/html/rfc1071).

/// Running one's complement sum of big-endian 16-bit words.
///
/// Data can be fed in pieces of any length. A piece of odd length is handled as if the next
/// piece directly followed it.
#[derive(Debug, Default, Clone)]
pub struct Checksum {
    sum: u64,
    /// Byte left over by a previous piece of odd length.
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Checksum {
        Checksum::default()
    }

    /// Adds bytes to the sum.
    pub fn add_bytes(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if let Some(high) = self.pending.take() {
            self.sum += u64::from(u16::from_be_bytes([high, data[0]]));
            data = &data[1..];
        }

        let mut chunks = data.chunks_exact(2);
        for chunk in &mut chunks {
            self.sum += u64::from(u16::from_be_bytes([chunk[0], chunk[1]]));
        }
        if let [last] = chunks.remainder() {
            self.pending = Some(*last);
        }
    }

    /// Adds a 16-bit value to the sum.
    pub fn add_u16(&mut self, value: u16) {
        self.add_bytes(&value.to_be_bytes());
    }

    /// Adds a 32-bit value to the sum, as two 16-bit words.
    pub fn add_u32(&mut self, value: u32) {
        self.add_bytes(&value.to_be_bytes());
    }

    /// Returns the folded sum, without the final complement.
    pub fn fold(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(high) = self.pending {
            sum += u64::from(high) << 8;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    /// Returns the value to write in a checksum field.
    pub fn finish(&self) -> u16 {
        !self.fold()
    }
}

/// Computes the checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = Checksum::new();
    sum.add_bytes(data);
    sum.finish()
}

/// Starts a sum with the pseudo-header used by TCP and UDP.
///
/// `src` and `dst` are either both 4 bytes (IPv4) or both 16 bytes (IPv6). `len` is the length
/// of the transport header plus payload.
pub fn pseudo_header(protocol: u8, src: &[u8], dst: &[u8], len: u32) -> Checksum {
    debug_assert_eq!(src.len(), dst.len());
    let mut sum = Checksum::new();
    sum.add_bytes(src);
    sum.add_bytes(dst);
    if src.len() == 4 {
        sum.add_u16(u16::from(protocol));
        sum.add_u16(len as u16);
    } else {
        sum.add_u32(len);
        sum.add_u32(u32::from(protocol));
    }
    sum
}
