//! The code cache: a [`CacheEntry`] data model (§3) shared by the on-disk pair (C3, [`disk`]) and
//! the in-memory fast path (C4, [`lookup`]).

pub mod disk;
pub mod lookup;

pub use disk::CodeCache;
pub use lookup::LookupCache;

/// A single `(start_offset, length)` span of guest bytes, relative to a block's `GuestRIP`, that
/// a [`CacheEntry`]'s fingerprint is computed over.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GuestRange {
    pub start_offset: i64,
    pub length: u64,
}

/// The component-agnostic prefix of every cache entry (§3). The IR cache appends a register
/// allocation blob plus an encoded [`crate::ir::IrList`]; the Obj cache appends host code bytes
/// plus a relocations blob. This crate keeps both payload kinds as an opaque byte vector since
/// the AArch64 emitter that would interpret the Obj payload is out of scope (§1).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheEntry {
    pub guest_hash: u64,
    pub guest_ranges: Vec<GuestRange>,
    pub payload: Vec<u8>,
}

/// Computes the `GuestHash` fingerprint (§3, §4.3): XXH3-64 with a running seed over the
/// concatenation of each range's bytes, in order. `read_range` is injected so the dispatcher's
/// real guest-memory reader and a test's in-memory fake guest image can share this function.
pub fn fingerprint(
    guest_rip: u64,
    ranges: &[GuestRange],
    mut read_range: impl FnMut(u64, u64) -> Vec<u8>,
) -> u64 {
    let mut seed = 0u64;

    for range in ranges {
        let addr = (guest_rip as i64).wrapping_add(range.start_offset) as u64;
        let bytes = read_range(addr, range.length);
        seed = twox_hash::xxh3::hash64_with_seed(&bytes, seed);
    }

    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_changes_when_bytes_change() {
        let ranges = vec![GuestRange { start_offset: 0, length: 4 }];
        let a = fingerprint(0x1000, &ranges, |_, len| vec![0u8; len as usize]);
        let b = fingerprint(0x1000, &ranges, |_, len| vec![1u8; len as usize]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let ranges = vec![GuestRange { start_offset: 0, length: 8 }, GuestRange { start_offset: 16, length: 4 }];
        let read = |addr: u64, len: u64| (addr..addr + len).map(|b| b as u8).collect();
        let a = fingerprint(0x2000, &ranges, read);
        let b = fingerprint(0x2000, &ranges, read);
        assert_eq!(a, b);
    }
}
