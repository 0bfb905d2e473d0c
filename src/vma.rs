//! The guest VMA tracker (C1, §4.1).
//!
//! Keeps the authoritative, non-overlapping map of guest virtual memory, splitting and merging
//! entries as `mmap`/`munmap`/`mprotect` and SysV SHM operations are applied, and maintains a
//! per-resource list of every VMA referencing a given [`MappedResource`] so that cache
//! invalidation and resource teardown can walk it directly instead of rescanning the whole map.

use bitflags::bitflags;
use std::collections::BTreeMap;

bitflags! {
    pub struct Prot: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

/// A file-backed or SysV-SHM backing a VMA, arena-indexed per the design note in §9 ("Cyclic VMA
/// lists"): rather than raw intrusive back-pointers, each resource owns the head of a `Vec`-backed
/// linked list of [`ResourceArena`] slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResourceId(pub u64);

/// An index into [`ResourceArena`]'s slot vector; `None` terminates a list.
type ArenaIndex = Option<u32>;

struct ArenaSlot {
    base: u64,
    prev: ArenaIndex,
    next: ArenaIndex,
}

/// Owns, per [`ResourceId`], a doubly-linked list of the VMA bases currently referencing it.
/// Replaces the teacher's (and the original's) intrusive back-pointer lists with a plain,
/// generation-free arena (§9's decision): slots are never reused across resources, only freed.
#[derive(Default)]
struct ResourceArena {
    slots: Vec<ArenaSlot>,
    heads: std::collections::HashMap<u64, ArenaIndex>,
}

impl ResourceArena {
    fn push_front(&mut self, resource: ResourceId, base: u64) -> u32 {
        let head = self.heads.get(&resource.0).copied().flatten();
        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot { base, prev: None, next: head });

        if let Some(head_index) = head {
            self.slots[head_index as usize].prev = Some(index);
        }

        self.heads.insert(resource.0, Some(index));
        index
    }

    fn remove(&mut self, resource: ResourceId, slot: u32) {
        let (prev, next) = {
            let s = &self.slots[slot as usize];
            (s.prev, s.next)
        };

        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => {
                self.heads.insert(resource.0, next);
            }
        }

        if let Some(n) = next {
            self.slots[n as usize].prev = prev;
        }
    }

    fn is_empty(&self, resource: ResourceId) -> bool {
        self.heads.get(&resource.0).copied().flatten().is_none()
    }

    fn bases(&self, resource: ResourceId) -> Vec<u64> {
        let mut out = Vec::new();
        let mut current = self.heads.get(&resource.0).copied().flatten();

        while let Some(index) = current {
            out.push(self.slots[index as usize].base);
            current = self.slots[index as usize].next;
        }

        out
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VmaEntry {
    pub resource: Option<ResourceId>,
    pub base: u64,
    pub offset: u64,
    pub length: u64,
    pub shared: bool,
    pub prot: Prot,
}

impl VmaEntry {
    fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// The per-process VMA tracker (C1).
#[derive(Default)]
pub struct VmaTracker {
    by_base: BTreeMap<u64, VmaEntry>,
    resource_lists: ResourceArena,
    resource_slot_of: std::collections::HashMap<(u64, u64), u32>, // (resource, base) -> slot
}

impl VmaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn link_resource(&mut self, resource: ResourceId, base: u64) {
        let slot = self.resource_lists.push_front(resource, base);
        self.resource_slot_of.insert((resource.0, base), slot);
    }

    fn unlink_resource(&mut self, resource: ResourceId, base: u64) -> bool {
        if let Some(slot) = self.resource_slot_of.remove(&(resource.0, base)) {
            self.resource_lists.remove(resource, slot);
        }

        self.resource_lists.is_empty(resource)
    }

    /// `find_vma` (§4.1): strict containment test.
    pub fn find_vma(&self, addr: u64) -> Option<&VmaEntry> {
        self.by_base
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| addr < entry.end())
    }

    fn overlapping_bases(&self, start: u64, end: u64) -> Vec<u64> {
        let mut bases: Vec<u64> = self
            .by_base
            .range(..end)
            .filter(|(base, entry)| **base + entry.length > start)
            .map(|(base, _)| *base)
            .collect();

        bases.sort_unstable_by(|a, b| b.cmp(a)); // process back-to-front per §4.1.
        bases
    }

    /// `track_range` (§4.1): replace any existing coverage of `[base, base+length)` with the new
    /// mapping.
    pub fn track_range(&mut self, base: u64, offset: u64, length: u64, shared: bool, prot: Prot, resource: Option<ResourceId>) {
        self.delete_range(base, length, None);

        if let Some(resource_id) = resource {
            self.link_resource(resource_id, base);
        }

        self.by_base.insert(base, VmaEntry { resource, base, offset, length, shared, prot });
    }

    /// `delete_range` (§4.1): remove all coverage over `[base, base+length)`, splitting edge VMAs
    /// per the four cases named in §4.1, freeing any [`MappedResource`] whose last VMA disappears
    /// (unless it equals `preserved_resource`).
    pub fn delete_range(&mut self, base: u64, length: u64, preserved_resource: Option<ResourceId>) -> Vec<ResourceId> {
        let end = base + length;
        let mut freed = Vec::new();

        for overlap_base in self.overlapping_bases(base, end) {
            let entry = *self.by_base.get(&overlap_base).unwrap();
            let (mb, mt) = (entry.base, entry.end());

            self.by_base.remove(&overlap_base);

            if let Some(resource) = entry.resource {
                self.unlink_resource(resource, overlap_base);
            }

            let left_remainder = mb < base;
            let right_remainder = mt > end;

            if left_remainder {
                let shrunk = VmaEntry { length: base - mb, ..entry };
                if let Some(resource) = entry.resource {
                    self.link_resource(resource, mb);
                }
                self.by_base.insert(mb, shrunk);
            }

            if right_remainder {
                let new_base = end;
                let remainder = VmaEntry {
                    base: new_base,
                    offset: entry.offset + (new_base - mb),
                    length: mt - end,
                    ..entry
                };
                if let Some(resource) = entry.resource {
                    self.link_resource(resource, new_base);
                }
                self.by_base.insert(new_base, remainder);
            }

            // Only report the resource freed once every remainder of this VMA has re-linked it;
            // otherwise a munmap that punches a hole in the middle (both remainders present)
            // would transiently empty the list and be misreported as freed (§4.1).
            if let Some(resource) = entry.resource {
                if self.resource_lists.is_empty(resource) && Some(resource) != preserved_resource {
                    freed.push(resource);
                }
            }
        }

        freed
    }

    /// `change_protection` (§4.1): apply `new_prot` over `[base, base+length)`, splitting VMAs at
    /// both edges; the untouched edges keep their original protection.
    pub fn change_protection(&mut self, base: u64, length: u64, new_prot: Prot) {
        let end = base + length;

        for overlap_base in self.overlapping_bases(base, end) {
            let entry = *self.by_base.get(&overlap_base).unwrap();
            let (mb, mt) = (entry.base, entry.end());

            let intersect_start = mb.max(base);
            let intersect_end = mt.min(end);

            if intersect_start >= intersect_end {
                continue;
            }

            self.by_base.remove(&overlap_base);
            if let Some(resource) = entry.resource {
                self.unlink_resource(resource, overlap_base);
            }

            if mb < intersect_start {
                let left = VmaEntry { length: intersect_start - mb, ..entry };
                if let Some(resource) = entry.resource {
                    self.link_resource(resource, mb);
                }
                self.by_base.insert(mb, left);
            }

            let middle = VmaEntry {
                base: intersect_start,
                offset: entry.offset + (intersect_start - mb),
                length: intersect_end - intersect_start,
                prot: new_prot,
                ..entry
            };
            if let Some(resource) = entry.resource {
                self.link_resource(resource, intersect_start);
            }
            self.by_base.insert(intersect_start, middle);

            if mt > intersect_end {
                let right = VmaEntry {
                    base: intersect_end,
                    offset: entry.offset + (intersect_end - mb),
                    length: mt - intersect_end,
                    ..entry
                };
                if let Some(resource) = entry.resource {
                    self.link_resource(resource, intersect_end);
                }
                self.by_base.insert(intersect_end, right);
            }
        }
    }

    /// `delete_shm_region` (§4.1): erase every VMA whose resource matches the SysV-SHM resource
    /// rooted at `base`, returning its total size.
    pub fn delete_shm_region(&mut self, base: u64) -> u64 {
        let resource = match self.find_vma(base).and_then(|e| e.resource) {
            Some(r) => r,
            None => return 0,
        };

        let bases = self.resource_lists.bases(resource);
        let mut total = 0u64;

        for vma_base in bases {
            if let Some(entry) = self.by_base.remove(&vma_base) {
                total += entry.length;
                self.resource_slot_of.remove(&(resource.0, vma_base));
            }
        }

        total
    }

    #[cfg(test)]
    fn invariant_non_overlapping(&self) -> bool {
        let mut last_end = None;
        for (&base, entry) in self.by_base.iter() {
            if let Some(prev_end) = last_end {
                if base < prev_end {
                    return false;
                }
            }
            last_end = Some(entry.end());
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_then_find() {
        let mut tracker = VmaTracker::new();
        tracker.track_range(0x1000, 0, 0x1000, false, Prot::READ | Prot::WRITE, None);
        let found = tracker.find_vma(0x1500).unwrap();
        assert_eq!(found.base, 0x1000);
        assert!(tracker.invariant_non_overlapping());
    }

    #[test]
    fn delete_range_splits_both_edges() {
        let mut tracker = VmaTracker::new();
        tracker.track_range(0x1000, 0, 0x3000, false, Prot::READ, None);
        tracker.delete_range(0x2000, 0x1000, None);

        assert!(tracker.find_vma(0x1500).is_some());
        assert!(tracker.find_vma(0x2500).is_none());
        assert!(tracker.find_vma(0x3500).is_some());
        assert!(tracker.invariant_non_overlapping());
    }

    #[test]
    fn delete_range_shrinks_left_edge_only() {
        let mut tracker = VmaTracker::new();
        tracker.track_range(0x1000, 0, 0x2000, false, Prot::READ, None);
        tracker.delete_range(0x2000, 0x1000, None);

        assert!(tracker.find_vma(0x1500).is_some());
        assert!(tracker.find_vma(0x2500).is_none());
        assert!(tracker.invariant_non_overlapping());
    }

    #[test]
    fn change_protection_splits_and_preserves_edges() {
        let mut tracker = VmaTracker::new();
        tracker.track_range(0x1000, 0, 0x3000, false, Prot::READ, None);
        tracker.change_protection(0x2000, 0x1000, Prot::READ | Prot::WRITE | Prot::EXEC);

        assert_eq!(tracker.find_vma(0x1500).unwrap().prot, Prot::READ);
        assert_eq!(tracker.find_vma(0x2500).unwrap().prot, Prot::READ | Prot::WRITE | Prot::EXEC);
        assert_eq!(tracker.find_vma(0x3500).unwrap().prot, Prot::READ);
        assert!(tracker.invariant_non_overlapping());
    }

    #[test]
    fn delete_shm_region_returns_total_size_and_frees_all_vmas() {
        let mut tracker = VmaTracker::new();
        let resource = ResourceId(42);
        tracker.track_range(0x1000, 0, 0x1000, true, Prot::READ | Prot::WRITE, Some(resource));
        tracker.track_range(0x2000, 0x1000, 0x1000, true, Prot::READ | Prot::WRITE, Some(resource));

        let total = tracker.delete_shm_region(0x1000);
        assert_eq!(total, 0x2000);
        assert!(tracker.find_vma(0x1500).is_none());
        assert!(tracker.find_vma(0x2500).is_none());
    }

    #[test]
    fn last_vma_removal_frees_the_resource() {
        let mut tracker = VmaTracker::new();
        let resource = ResourceId(7);
        tracker.track_range(0x1000, 0, 0x1000, true, Prot::READ, Some(resource));
        let freed = tracker.delete_range(0x1000, 0x1000, None);
        assert_eq!(freed, vec![resource]);
    }

    #[test]
    fn preserved_resource_is_not_reported_freed() {
        let mut tracker = VmaTracker::new();
        let resource = ResourceId(7);
        tracker.track_range(0x1000, 0, 0x1000, true, Prot::READ, Some(resource));
        let freed = tracker.delete_range(0x1000, 0x1000, Some(resource));
        assert!(freed.is_empty());
    }
}
