//! The on-disk, multi-process code cache (C3, §4.3).
//!
//! Two memory-mapped files per cache kind (§3: "On-disk index (C3)"): an index file holding an
//! append-only binary search tree keyed by `GuestStart`, and a data file holding the actual
//! cache entry bytes in 16 MiB chunks. This module implements the find/insert algorithm exactly
//! as described in §4.3, including the two-second reservation-adoption window and the
//! crash-safety argument it relies on.
//!
//! The mapped files are treated as raw byte regions with explicitly defined, fixed-layout
//! fields (§9: "Raw-memory on-disk index"), accessed through small offset-based helpers rather
//! than a transmuted `#[repr(C)]` overlay, so that endianness and alignment are never left
//! implicit.

use crate::cache::CacheEntry;
use crate::error::Error;
use mmap_rs::MmapOptions;
use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of a data file chunk (§6: "Data file is chunked at 16 MiB").
pub const CHUNK_SIZE: u64 = 16 * 1024 * 1024;
/// Maximum number of chunks a data file may grow to (§6: "capped at 1024 chunks").
pub const MAX_CHUNKS: u32 = 1024;
/// Sentinel threshold (§3 glossary): `DataOffset` values at or above this are reservation
/// timestamps, values below are finalized byte offsets.
pub const DATA_OFFSET_TIME_BASE: u64 = u64::MAX - 65535;
/// How long a reservation may sit unfinalized before another writer may adopt it (§4.3).
const RESERVATION_STALE_SECS: u64 = 2;
/// How many entries' worth of space to grow the index file by when it runs out of room.
const INDEX_GROWTH_ENTRIES: u64 = 4096;

const INDEX_HEADER_SIZE: usize = 24; // fourcc(4) + version(4) + file_size(8) + count(8)
const INDEX_ENTRY_SIZE: usize = 24; // guest_start(8) + left(4) + right(4) + data_offset(8)
const DATA_HEADER_SIZE: usize = 24; // fourcc(4) + version(4) + chunks_used(4) + pad(4) + write_pointer(8)

const NONE_LINK: u32 = u32::MAX;

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn write_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

fn write_u64(bytes: &mut [u8], offset: usize, value: u64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn now_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Takes an advisory, whole-file, blocking write lock for the duration of the closure, matching
/// §4.3/§5's `fcntl(F_SETLKW)` critical sections.
fn with_file_lock<T>(file: &File, f: impl FnOnce() -> T) -> Result<T, Error> {
    use std::os::unix::io::AsRawFd;

    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as i16;
    lock.l_whence = libc::SEEK_SET as i16;
    lock.l_start = 0;
    lock.l_len = 0;

    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lock) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let result = f();

    lock.l_type = libc::F_UNLCK as i16;
    unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };

    Ok(result)
}

/// A memory-mapped file grown on demand, re-mapped whenever its logical size changes.
struct MappedFile {
    file: File,
    mmap: mmap_rs::MmapMut,
    mapped_len: u64,
}

impl MappedFile {
    fn open(path: &std::path::Path, initial_len: u64) -> Result<Self, Error> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;

        if file.metadata()?.len() < initial_len {
            file.set_len(initial_len)?;
        }

        let mmap = unsafe {
            MmapOptions::new()
                .with_size(initial_len as usize)
                .with_file(&file, 0)
                .map_mut()?
        };

        Ok(Self { file, mmap, mapped_len: initial_len })
    }

    fn grow_to(&mut self, new_len: u64) -> Result<(), Error> {
        if new_len <= self.mapped_len {
            return Ok(());
        }

        self.file.set_len(new_len)?;

        self.mmap = unsafe {
            MmapOptions::new()
                .with_size(new_len as usize)
                .with_file(&self.file, 0)
                .map_mut()?
        };
        self.mapped_len = new_len;

        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        self.mmap.as_slice()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.mmap.as_mut_slice()
    }
}

/// An (IR or Obj) on-disk cache: an index file and a data file sharing a versioned tag.
///
/// Cross-process mutation ordering is serialized by the `F_SETLKW` critical sections in
/// [`with_file_lock`]. Cross-thread access within one process relies on the ordinary Rust rule
/// that mutating a `CodeCache` requires `&mut self`; callers sharing one across threads do so
/// through a `Mutex<CodeCache>` at the call site (§4.3, §5: "a per-process mutex").
pub struct CodeCache {
    index: MappedFile,
    data: MappedFile,
    fourcc: [u8; 4],
    version: u32,
}

impl CodeCache {
    /// Opens (creating if necessary) an index/data file pair. `fourcc`/`version` identify the
    /// cache kind (IR vs Obj) and format generation (§6); a mismatch against what is already on
    /// disk zeroes and rebuilds both files (§7: "File tag mismatch -> zero the file and rebuild
    /// from scratch").
    pub fn open(index_path: &std::path::Path, data_path: &std::path::Path, fourcc: [u8; 4], version: u32) -> Result<Self, Error> {
        let initial_index_len = INDEX_HEADER_SIZE as u64 + INDEX_GROWTH_ENTRIES * INDEX_ENTRY_SIZE as u64;
        let initial_data_len = DATA_HEADER_SIZE as u64 + CHUNK_SIZE;

        let index = MappedFile::open(index_path, initial_index_len)?;
        let data = MappedFile::open(data_path, initial_data_len)?;

        let mut cache = Self { index, data, fourcc, version };
        cache.reset_if_tag_mismatch()?;

        Ok(cache)
    }

    fn header_tag_matches(bytes: &[u8], fourcc: [u8; 4], version: u32) -> bool {
        bytes[0..4] == fourcc && read_u32(bytes, 4) == version
    }

    fn reset_if_tag_mismatch(&mut self) -> Result<(), Error> {
        let index_ok = Self::header_tag_matches(self.index.bytes(), self.fourcc, self.version);
        let data_ok = Self::header_tag_matches(self.data.bytes(), self.fourcc, self.version);

        if index_ok && data_ok {
            return Ok(());
        }

        tracing::warn!(fourcc = ?self.fourcc, "code cache tag mismatch, rebuilding from scratch");

        {
            let index_len = self.index.mapped_len;
            let bytes = self.index.bytes_mut();
            bytes[0..4].copy_from_slice(&self.fourcc);
            write_u32(bytes, 4, self.version);
            write_u64(bytes, 8, index_len);
            write_u64(bytes, 16, 0); // Count
        }

        {
            let bytes = self.data.bytes_mut();
            bytes[0..4].copy_from_slice(&self.fourcc);
            write_u32(bytes, 4, self.version);
            write_u32(bytes, 8, 1); // ChunksUsed
            write_u64(bytes, 16, 0); // WritePointer within current chunk
        }

        Ok(())
    }

    fn count(&self) -> u64 {
        read_u64(self.index.bytes(), 16)
    }

    fn set_count(&mut self, value: u64) {
        write_u64(self.index.bytes_mut(), 16, value);
    }

    fn entry_offset(index: u64) -> usize {
        INDEX_HEADER_SIZE + (index as usize) * INDEX_ENTRY_SIZE
    }

    fn entry_guest_start(&self, index: u64) -> u64 {
        read_u64(self.index.bytes(), Self::entry_offset(index))
    }

    fn entry_left(&self, index: u64) -> u32 {
        read_u32(self.index.bytes(), Self::entry_offset(index) + 8)
    }

    fn entry_right(&self, index: u64) -> u32 {
        read_u32(self.index.bytes(), Self::entry_offset(index) + 12)
    }

    fn entry_data_offset(&self, index: u64) -> u64 {
        read_u64(self.index.bytes(), Self::entry_offset(index) + 16)
    }

    fn set_entry_data_offset(&mut self, index: u64, value: u64) {
        write_u64(self.index.bytes_mut(), Self::entry_offset(index) + 16, value);
    }

    fn set_entry_link(&mut self, index: u64, is_left: bool, child: u32) {
        let byte_offset = Self::entry_offset(index) + if is_left { 8 } else { 12 };
        write_u32(self.index.bytes_mut(), byte_offset, child);
    }

    fn write_new_entry(&mut self, index: u64, guest_start: u64, data_offset: u64) {
        let offset = Self::entry_offset(index);
        let bytes = self.index.bytes_mut();
        write_u64(bytes, offset, guest_start);
        write_u32(bytes, offset + 8, NONE_LINK);
        write_u32(bytes, offset + 12, NONE_LINK);
        write_u64(bytes, offset + 16, data_offset);
    }

    fn ensure_index_capacity(&mut self, entries_needed: u64) -> Result<(), Error> {
        let needed_len = INDEX_HEADER_SIZE as u64 + entries_needed * INDEX_ENTRY_SIZE as u64;
        if needed_len > self.index.mapped_len {
            let grown = needed_len + INDEX_GROWTH_ENTRIES * INDEX_ENTRY_SIZE as u64;
            self.index.grow_to(grown)?;
        }

        Ok(())
    }

    /// Walks the BST from the root looking for `guest_start`. Returns `Ok(index)` of either the
    /// matching entry, or `Err(parent_index, is_left)` describing the insertion point, or `None`
    /// if the tree is empty.
    fn find_in_tree(&self, guest_start: u64) -> Option<Result<u64, (u64, bool)>> {
        if self.count() == 0 {
            return None;
        }

        let mut current = 0u64;

        loop {
            let candidate = self.entry_guest_start(current);

            if candidate == guest_start {
                return Some(Ok(current));
            }

            let go_left = guest_start < candidate;
            let child = if go_left { self.entry_left(current) } else { self.entry_right(current) };

            if child == NONE_LINK {
                return Some(Err((current, go_left)));
            }

            current = child as u64;
        }
    }

    /// §4.3 "Lookup": finds the cache entry for `offset_rip`, re-validating its fingerprint
    /// against live guest memory via `read_range` before returning it.
    pub fn find(
        &mut self,
        offset_rip: u64,
        guest_rip: u64,
        read_range: impl FnMut(u64, u64) -> Vec<u8>,
    ) -> Result<Option<CacheEntry>, Error> {
        let located = match self.find_in_tree(offset_rip) {
            Some(Ok(index)) => index,
            _ => return Ok(None),
        };

        let data_offset = self.entry_data_offset(located);

        if data_offset >= DATA_OFFSET_TIME_BASE {
            return Ok(None); // reserved, not yet written.
        }

        let chunk = data_offset / CHUNK_SIZE;
        let offset_in_chunk = data_offset % CHUNK_SIZE;
        self.ensure_data_capacity(chunk + 1)?;

        let entry = self.read_entry_at(chunk, offset_in_chunk)?;
        let recomputed = crate::cache::fingerprint(guest_rip, &entry.guest_ranges, read_range);

        if recomputed != entry.guest_hash {
            return Ok(None); // guest code changed under us.
        }

        Ok(Some(entry))
    }

    fn ensure_data_capacity(&mut self, chunks_needed: u64) -> Result<(), Error> {
        let needed_len = DATA_HEADER_SIZE as u64 + chunks_needed * CHUNK_SIZE;
        self.data.grow_to(needed_len)
    }

    fn chunk_base(chunk: u64) -> usize {
        DATA_HEADER_SIZE + (chunk * CHUNK_SIZE) as usize
    }

    fn read_entry_at(&self, chunk: u64, offset_in_chunk: u64) -> Result<CacheEntry, Error> {
        let base = Self::chunk_base(chunk) + offset_in_chunk as usize;
        let bytes = self.data.bytes();

        let guest_hash = read_u64(bytes, base);
        let range_count = read_u64(bytes, base + 8) as usize;

        let mut guest_ranges = Vec::with_capacity(range_count);
        let mut cursor = base + 16;

        for _ in 0..range_count {
            let start_offset = read_u64(bytes, cursor) as i64;
            let length = read_u64(bytes, cursor + 8);
            guest_ranges.push(super::GuestRange { start_offset, length });
            cursor += 16;
        }

        let payload_len = read_u64(bytes, cursor) as usize;
        cursor += 8;
        let payload = bytes[cursor..cursor + payload_len].to_vec();

        Ok(CacheEntry { guest_hash, guest_ranges, payload })
    }

    fn entry_inline_size(ranges: usize, payload_len: usize) -> usize {
        8 + 8 + ranges * 16 + 8 + payload_len
    }

    fn align_up(value: usize, align: usize) -> usize {
        (value + align - 1) / align * align
    }

    /// §4.3 "Insert": reserves an index entry, bump-allocates data space, calls `fill` to
    /// populate the entry, fingerprints it, then finalizes the reservation with a
    /// compare-and-publish. Returns the finalized entry.
    pub fn insert(
        &mut self,
        offset_rip: u64,
        guest_rip: u64,
        fill: impl FnOnce() -> CacheEntry,
    ) -> Result<CacheEntry, Error> {
        let reservation_index = self.reserve_index_entry(offset_rip)?;

        let reservation_index = match reservation_index {
            Some(index) => index,
            None => {
                // Another writer already finalized this entry; re-read and return it.
                let index = match self.find_in_tree(offset_rip) {
                    Some(Ok(index)) => index,
                    _ => return Err(Error::VmaInvariant("reservation disappeared")),
                };
                let data_offset = self.entry_data_offset(index);
                let chunk = data_offset / CHUNK_SIZE;
                let offset_in_chunk = data_offset % CHUNK_SIZE;
                return self.read_entry_at(chunk, offset_in_chunk);
            }
        };

        let entry = fill();
        let inline_size = Self::align_up(
            Self::entry_inline_size(entry.guest_ranges.len(), entry.payload.len()),
            32,
        );

        let (chunk, offset_in_chunk) = self.bump_allocate(inline_size)?;
        self.write_entry_at(chunk, offset_in_chunk, &entry);

        let finalized = chunk * CHUNK_SIZE + offset_in_chunk;
        self.finalize_reservation(reservation_index, finalized)?;

        Ok(entry)
    }

    /// Returns `Some(index)` for a newly created reservation, or `None` if another writer's
    /// finalized entry already exists for `offset_rip`.
    fn reserve_index_entry(&mut self, offset_rip: u64) -> Result<Option<u64>, Error> {
        let file = self.index.file.try_clone()?;

        with_file_lock(&file, || -> Result<Option<u64>, Error> {
            match self.find_in_tree(offset_rip) {
                Some(Ok(index)) => {
                    let data_offset = self.entry_data_offset(index);

                    if data_offset < DATA_OFFSET_TIME_BASE {
                        return Ok(None); // finalized: another writer won.
                    }

                    let reserved_at = data_offset - DATA_OFFSET_TIME_BASE;

                    if now_timestamp().saturating_sub(reserved_at) >= RESERVATION_STALE_SECS {
                        self.set_entry_data_offset(index, DATA_OFFSET_TIME_BASE + now_timestamp());
                        return Ok(Some(index));
                    }

                    Ok(None) // a live writer owns this reservation; yield.
                }
                Some(Err((parent, is_left))) => {
                    let new_index = self.count();
                    self.ensure_index_capacity(new_index + 1)?;
                    self.write_new_entry(new_index, offset_rip, DATA_OFFSET_TIME_BASE + now_timestamp());
                    self.set_entry_link(parent, is_left, new_index as u32);
                    self.set_count(new_index + 1);
                    Ok(Some(new_index))
                }
                None => {
                    // Empty tree: this entry becomes the root.
                    self.ensure_index_capacity(1)?;
                    self.write_new_entry(0, offset_rip, DATA_OFFSET_TIME_BASE + now_timestamp());
                    self.set_count(1);
                    Ok(Some(0))
                }
            }
        })?
    }

    fn bump_allocate(&mut self, size: usize) -> Result<(u64, u64), Error> {
        let file = self.data.file.try_clone()?;

        with_file_lock(&file, || -> Result<(u64, u64), Error> {
            let chunks_used = read_u32(self.data.bytes(), 8) as u64;
            let write_pointer = read_u64(self.data.bytes(), 16);

            if write_pointer + size as u64 <= CHUNK_SIZE {
                write_u64(self.data.bytes_mut(), 16, write_pointer + size as u64);
                return Ok((chunks_used - 1, write_pointer));
            }

            if chunks_used as u32 >= MAX_CHUNKS - 1 {
                return Err(Error::ChunkExhaustion);
            }

            self.ensure_data_capacity(chunks_used + 1)?;
            write_u32(self.data.bytes_mut(), 8, (chunks_used + 1) as u32);
            write_u64(self.data.bytes_mut(), 16, size as u64);

            Ok((chunks_used, 0))
        })?
    }

    fn write_entry_at(&mut self, chunk: u64, offset_in_chunk: u64, entry: &CacheEntry) {
        let base = Self::chunk_base(chunk) + offset_in_chunk as usize;
        let bytes = self.data.bytes_mut();

        write_u64(bytes, base, entry.guest_hash);
        write_u64(bytes, base + 8, entry.guest_ranges.len() as u64);

        let mut cursor = base + 16;
        for range in &entry.guest_ranges {
            write_u64(bytes, cursor, range.start_offset as u64);
            write_u64(bytes, cursor + 8, range.length);
            cursor += 16;
        }

        write_u64(bytes, cursor, entry.payload.len() as u64);
        cursor += 8;
        bytes[cursor..cursor + entry.payload.len()].copy_from_slice(&entry.payload);
    }

    fn finalize_reservation(&mut self, index: u64, finalized_offset: u64) -> Result<(), Error> {
        let file = self.index.file.try_clone()?;

        with_file_lock(&file, || {
            let current = self.entry_data_offset(index);

            // CAS: only publish if the reservation we made is still the one recorded. Another,
            // older reservation's adopter finalizing first is reported as harmless (§4.3 step 5).
            if current >= DATA_OFFSET_TIME_BASE {
                self.set_entry_data_offset(index, finalized_offset);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::GuestRange;

    fn open_test_cache(dir: &tempfile::TempDir) -> CodeCache {
        CodeCache::open(&dir.path().join("index"), &dir.path().join("data"), *b"OBJ1", 1).unwrap()
    }

    #[test]
    fn insert_then_find_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_test_cache(&dir);

        let guest_rip = 0x1000u64;
        let ranges = vec![GuestRange { start_offset: 0, length: 4 }];
        let code = vec![0xaau8; 16];

        cache
            .insert(guest_rip, guest_rip, || CacheEntry {
                guest_hash: crate::cache::fingerprint(guest_rip, &ranges, |_, len| vec![0u8; len as usize]),
                guest_ranges: ranges.clone(),
                payload: code.clone(),
            })
            .unwrap();

        let found = cache.find(guest_rip, guest_rip, |_, len| vec![0u8; len as usize]).unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().payload, code);
    }

    #[test]
    fn find_misses_when_guest_bytes_changed() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_test_cache(&dir);

        let guest_rip = 0x2000u64;
        let ranges = vec![GuestRange { start_offset: 0, length: 4 }];

        cache
            .insert(guest_rip, guest_rip, || CacheEntry {
                guest_hash: crate::cache::fingerprint(guest_rip, &ranges, |_, len| vec![0u8; len as usize]),
                guest_ranges: ranges.clone(),
                payload: vec![1, 2, 3],
            })
            .unwrap();

        let found = cache.find(guest_rip, guest_rip, |_, len| vec![9u8; len as usize]).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn find_misses_on_unknown_rip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_test_cache(&dir);
        let found = cache.find(0xdead, 0xdead, |_, len| vec![0u8; len as usize]).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn multiple_entries_share_one_tree() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = open_test_cache(&dir);

        for rip in [0x1000u64, 0x500, 0x2000, 0x1500] {
            let ranges = vec![GuestRange { start_offset: 0, length: 1 }];
            cache
                .insert(rip, rip, || CacheEntry {
                    guest_hash: crate::cache::fingerprint(rip, &ranges, |_, len| vec![0u8; len as usize]),
                    guest_ranges: ranges,
                    payload: vec![rip as u8],
                })
                .unwrap();
        }

        for rip in [0x1000u64, 0x500, 0x2000, 0x1500] {
            let found = cache.find(rip, rip, |_, len| vec![0u8; len as usize]).unwrap();
            assert!(found.is_some(), "missing entry for {rip:#x}");
        }
    }

    #[test]
    fn reopening_with_matching_tag_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index");
        let data_path = dir.path().join("data");

        {
            let mut cache = CodeCache::open(&index_path, &data_path, *b"OBJ1", 1).unwrap();
            let ranges = vec![GuestRange { start_offset: 0, length: 1 }];
            cache
                .insert(0x100, 0x100, || CacheEntry {
                    guest_hash: crate::cache::fingerprint(0x100, &ranges, |_, len| vec![0u8; len as usize]),
                    guest_ranges: ranges,
                    payload: vec![7],
                })
                .unwrap();
        }

        let mut reopened = CodeCache::open(&index_path, &data_path, *b"OBJ1", 1).unwrap();
        let found = reopened.find(0x100, 0x100, |_, len| vec![0u8; len as usize]).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn tag_mismatch_resets_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("index");
        let data_path = dir.path().join("data");

        {
            let mut cache = CodeCache::open(&index_path, &data_path, *b"OBJ1", 1).unwrap();
            let ranges = vec![GuestRange { start_offset: 0, length: 1 }];
            cache
                .insert(0x100, 0x100, || CacheEntry {
                    guest_hash: crate::cache::fingerprint(0x100, &ranges, |_, len| vec![0u8; len as usize]),
                    guest_ranges: ranges,
                    payload: vec![7],
                })
                .unwrap();
        }

        let mut reopened = CodeCache::open(&index_path, &data_path, *b"OBJ1", 2).unwrap();
        let found = reopened.find(0x100, 0x100, |_, len| vec![0u8; len as usize]).unwrap();
        assert!(found.is_none());
    }
}
