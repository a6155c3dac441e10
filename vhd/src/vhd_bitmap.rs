// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use crate::vec_cache::Cacheable;

/// Sector presence bitmap stored in front of every allocated block.
///
/// The most significant bit of each byte stands for the lowest sector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SectorBitmap {
    bits: Vec<u8>,
    dirty: bool,
}

impl SectorBitmap {
    /// An all clear bitmap spanning `size` bytes of on-disk bitmap region.
    pub fn new(size: usize) -> SectorBitmap {
        SectorBitmap {
            bits: vec![0; size],
            dirty: false,
        }
    }

    pub fn from_vec(bits: Vec<u8>) -> SectorBitmap {
        SectorBitmap { bits, dirty: false }
    }

    pub fn is_set(&self, sector: u32) -> bool {
        let byte = self.bits[(sector / 8) as usize];
        byte & (0x80 >> (sector % 8)) != 0
    }

    /// Sets the bit for `sector`, returning true if it was clear before.
    pub fn set(&mut self, sector: u32) -> bool {
        let byte = &mut self.bits[(sector / 8) as usize];
        let mask = 0x80 >> (sector % 8);
        let changed = *byte & mask == 0;
        *byte |= mask;
        if changed {
            self.dirty = true;
        }
        changed
    }

    /// Sets `count` bits starting at `first`. Returns true if any bit changed.
    pub fn set_range(&mut self, first: u32, count: u32) -> bool {
        let mut changed = false;
        for sector in first..first + count {
            changed |= self.set(sector);
        }
        changed
    }

    /// Length of the run of sectors starting at `first` that share the bit
    /// value of `first`, capped at `max`. Returns the value and the length.
    pub fn run(&self, first: u32, max: u32) -> (bool, u32) {
        let present = self.is_set(first);
        let mut len = 1;
        while len < max && self.is_set(first + len) == present {
            len += 1;
        }
        (present, len)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Cacheable for SectorBitmap {
    fn dirty(&self) -> bool {
        self.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msb_first_bit_order() {
        let mut bitmap = SectorBitmap::new(512);
        assert!(bitmap.set(0));
        assert!(bitmap.set(9));
        assert_eq!(bitmap.as_bytes()[0], 0x80);
        assert_eq!(bitmap.as_bytes()[1], 0x40);
        assert!(bitmap.is_set(9));
        assert!(!bitmap.is_set(8));
        assert!(!bitmap.set(0));
    }

    #[test]
    fn runs() {
        let mut bitmap = SectorBitmap::from_vec(vec![0; 512]);
        assert!(!bitmap.dirty());
        assert!(bitmap.set_range(4, 6));
        assert!(bitmap.dirty());
        assert_eq!(bitmap.run(0, 4096), (false, 4));
        assert_eq!(bitmap.run(4, 4092), (true, 6));
        assert_eq!(bitmap.run(5, 2), (true, 2));
        assert_eq!(bitmap.run(10, 4086), (false, 4086));

        bitmap.mark_clean();
        assert!(!bitmap.set_range(4, 6));
        assert!(!bitmap.dirty());
    }
}
