//! The memory- and thread-facing syscall surface (C9, §4.9).
//!
//! Routes `mmap`/`munmap`/`mprotect`/`mremap`/`shmat`/`shmdt`/`shmctl` through the VA allocator
//! (C2) and VMA tracker (C1), and reports which lookup-cache (C4) range and which C1 resources a
//! caller must invalidate as a result. The actual host syscalls and the per-thread lookup caches
//! themselves are out of this crate's reach (§1); this module is the decision logic, driven
//! through injected closures so it is fully testable.

use crate::error::Error;
use crate::valloc::{MmapError, VaAllocator};
use crate::vma::{Prot, ResourceId, VmaTracker};

/// `arch_prctl` subcommands (§4.9, §6).
pub const ARCH_SET_GS: u64 = 0x1001;
pub const ARCH_SET_FS: u64 = 0x1002;
pub const ARCH_GET_FS: u64 = 0x1003;
pub const ARCH_GET_GS: u64 = 0x1004;
pub const ARCH_SET_CPUID: u64 = 0x1012;
pub const ARCH_CET_STATUS: u64 = 0x4001;

/// A `[start, start + length)` range the caller must invalidate in every thread's C4 lookup
/// cache, returned alongside any C1 resources whose last VMA disappeared as a result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidatedRange {
    pub start: u64,
    pub length: u64,
}

/// The memory half of the syscall surface (C9). Owns C1 and forwards to a caller-owned C2.
pub struct MemorySyscalls<'a> {
    allocator: &'a VaAllocator,
    vma: VmaTracker,
}

impl<'a> MemorySyscalls<'a> {
    pub fn new(allocator: &'a VaAllocator) -> Self {
        Self { allocator, vma: VmaTracker::new() }
    }

    /// Rebuilds a [`MemorySyscalls`] around VMA state a caller is keeping alive across calls
    /// itself (e.g. [`crate::process::GuestProcess`], which owns the tracker behind its own lock
    /// so it can hand out a borrow of the allocator without holding the lock for the whole call).
    pub fn from_parts(allocator: &'a VaAllocator, vma: VmaTracker) -> Self {
        Self { allocator, vma }
    }

    /// Reclaims the VMA tracker, the counterpart to [`MemorySyscalls::from_parts`].
    pub fn into_vma(self) -> VmaTracker {
        self.vma
    }

    pub fn vma(&self) -> &VmaTracker {
        &self.vma
    }

    /// `mmap` (§4.9): allocates via C2, then records the mapping in C1. Any range it overwrote is
    /// reported for C4 invalidation.
    pub fn mmap(
        &mut self,
        addr: u64,
        length: u64,
        prot: Prot,
        shared: bool,
        resource: Option<ResourceId>,
        offset: u64,
        place: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(u64, InvalidatedRange), MmapError> {
        let chosen = self.allocator.mmap(addr, length, place)?;
        self.vma.track_range(chosen, offset, length, shared, prot, resource);

        Ok((chosen, InvalidatedRange { start: chosen, length }))
    }

    /// `munmap` (§4.9): frees via C2 and drops the C1 coverage, reporting both the C4 range to
    /// invalidate and any C1 resources whose backing C3 entries must also be invalidated.
    pub fn munmap(&mut self, addr: u64, length: u64) -> Result<(InvalidatedRange, Vec<ResourceId>), MmapError> {
        self.allocator.munmap(addr, length)?;
        let freed = self.vma.delete_range(addr, length, None);

        Ok((InvalidatedRange { start: addr, length }, freed))
    }

    /// `mprotect` (§4.9): re-splits C1 coverage over the range; always reported for C4
    /// invalidation since a protection change can gain or lose `EXEC`.
    pub fn mprotect(&mut self, addr: u64, length: u64, new_prot: Prot) -> InvalidatedRange {
        self.vma.change_protection(addr, length, new_prot);
        InvalidatedRange { start: addr, length }
    }

    /// `mremap` (§4.9, simplified to the fixed-destination case the original's `MUNMAP`+`MMAP`
    /// reduction also relies on): frees the old range, allocates the new one, and carries over
    /// the old mapping's resource, protection, and shared-ness.
    pub fn mremap(
        &mut self,
        old_addr: u64,
        old_length: u64,
        new_length: u64,
        place: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(u64, [InvalidatedRange; 2], Vec<ResourceId>), MmapError> {
        let old_entry = *self.vma.find_vma(old_addr).ok_or(MmapError::InvalidArgument)?;

        self.allocator.munmap(old_addr, old_length)?;
        let freed = self.vma.delete_range(old_addr, old_length, old_entry.resource);
        let new_addr = self.allocator.mmap(0, new_length, place)?;

        self.vma.track_range(new_addr, old_entry.offset, new_length, old_entry.shared, old_entry.prot, old_entry.resource);

        Ok((
            new_addr,
            [InvalidatedRange { start: old_addr, length: old_length }, InvalidatedRange { start: new_addr, length: new_length }],
            freed,
        ))
    }

    /// `shmat` (§4.9): attaches a SysV SHM segment at a C2-chosen or fixed address.
    pub fn shmat(
        &mut self,
        addr: u64,
        length: u64,
        prot: Prot,
        resource: ResourceId,
        place: impl FnMut(u64, u64) -> Result<(), Error>,
    ) -> Result<(u64, InvalidatedRange), MmapError> {
        self.mmap(addr, length, prot, true, Some(resource), 0, place)
    }

    /// `shmdt` (§4.9): detaches the SysV SHM segment containing `addr`, reporting its resource for
    /// C3 invalidation since the whole segment is always fully freed by detachment.
    pub fn shmdt(&mut self, addr: u64) -> Result<(InvalidatedRange, ResourceId), Error> {
        let resource = self.vma.find_vma(addr).and_then(|e| e.resource).ok_or(Error::InvalidGuestAddress)?;
        let total = self.vma.delete_shm_region(addr);

        Ok((InvalidatedRange { start: addr, length: total }, resource))
    }

    /// `shmctl` (§4.9): only `IPC_RMID`-style destruction reaches C1/C4; the SysV IPC object
    /// table itself belongs to the host kernel and is out of this crate's reach.
    pub fn shmctl_rmid(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// `arch_prctl` (§4.9). `state` is the calling thread's [`crate::state::GuestCpuState`].
pub fn arch_prctl(state: &mut crate::state::GuestCpuState, code: u64, addr: u64) -> Result<u64, Error> {
    match code {
        ARCH_SET_FS => {
            state.set_fs_base(addr)?;
            Ok(0)
        }
        ARCH_SET_GS => {
            state.set_gs_base(addr)?;
            Ok(0)
        }
        ARCH_GET_FS => Ok(state.fs_base),
        ARCH_GET_GS => Ok(state.gs_base),
        ARCH_SET_CPUID if addr == 0 => Err(Error::Syscall(-libc::ENODEV)),
        ARCH_CET_STATUS => Err(Error::Syscall(-libc::EINVAL)),
        _ => Err(Error::Syscall(-libc::EINVAL)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valloc::LOWER_BOUND;

    fn test_allocator() -> VaAllocator {
        VaAllocator::new(LOWER_BOUND + 16 * 4096, |_, _| true)
    }

    #[test]
    fn mmap_then_munmap_reports_ranges() {
        let allocator = test_allocator();
        let mut syscalls = MemorySyscalls::new(&allocator);

        let (addr, range) = syscalls.mmap(0, 4096, Prot::READ | Prot::WRITE, false, None, 0, |_, _| Ok(())).unwrap();
        assert_eq!(range, InvalidatedRange { start: addr, length: 4096 });

        let (range, freed) = syscalls.munmap(addr, 4096).unwrap();
        assert_eq!(range.start, addr);
        assert!(freed.is_empty());
        assert!(syscalls.vma().find_vma(addr).is_none());
    }

    #[test]
    fn munmap_reports_freed_resource() {
        let allocator = test_allocator();
        let mut syscalls = MemorySyscalls::new(&allocator);
        let resource = ResourceId(5);

        let (addr, _) = syscalls.mmap(0, 4096, Prot::READ, true, Some(resource), 0, |_, _| Ok(())).unwrap();
        let (_, freed) = syscalls.munmap(addr, 4096).unwrap();
        assert_eq!(freed, vec![resource]);
    }

    #[test]
    fn mprotect_changes_protection_and_reports_range() {
        let allocator = test_allocator();
        let mut syscalls = MemorySyscalls::new(&allocator);

        let (addr, _) = syscalls.mmap(0, 4096, Prot::READ, false, None, 0, |_, _| Ok(())).unwrap();
        let range = syscalls.mprotect(addr, 4096, Prot::READ | Prot::EXEC);
        assert_eq!(range.length, 4096);
        assert_eq!(syscalls.vma().find_vma(addr).unwrap().prot, Prot::READ | Prot::EXEC);
    }

    #[test]
    fn mremap_moves_the_mapping_and_carries_metadata() {
        let allocator = test_allocator();
        let mut syscalls = MemorySyscalls::new(&allocator);

        let (addr, _) = syscalls.mmap(0, 4096, Prot::READ | Prot::WRITE, false, None, 0, |_, _| Ok(())).unwrap();
        let (new_addr, ranges, freed) = syscalls.mremap(addr, 4096, 8192, |_, _| Ok(())).unwrap();

        assert!(freed.is_empty());
        assert_eq!(ranges[0].start, addr);
        assert_eq!(ranges[1].start, new_addr);
        assert_eq!(syscalls.vma().find_vma(new_addr).unwrap().prot, Prot::READ | Prot::WRITE);
    }

    #[test]
    fn shmat_then_shmdt_frees_the_resource() {
        let allocator = test_allocator();
        let mut syscalls = MemorySyscalls::new(&allocator);
        let resource = ResourceId(9);

        let (addr, _) = syscalls.shmat(0, 4096, Prot::READ | Prot::WRITE, resource, |_, _| Ok(())).unwrap();
        let (range, freed_resource) = syscalls.shmdt(addr).unwrap();
        assert_eq!(freed_resource, resource);
        assert_eq!(range.length, 4096);
    }

    #[test]
    fn arch_prctl_rejects_non_canonical_fs() {
        let mut state = crate::state::GuestCpuState::default();
        let result = arch_prctl(&mut state, ARCH_SET_FS, 1 << 48);
        assert!(result.is_err());
    }

    #[test]
    fn arch_prctl_set_cpuid_zero_is_enodev() {
        let mut state = crate::state::GuestCpuState::default();
        let result = arch_prctl(&mut state, ARCH_SET_CPUID, 0);
        assert!(matches!(result, Err(Error::Syscall(errno)) if errno == -libc::ENODEV));
    }

    #[test]
    fn arch_prctl_cet_status_is_einval() {
        let mut state = crate::state::GuestCpuState::default();
        let result = arch_prctl(&mut state, ARCH_CET_STATUS, 0);
        assert!(matches!(result, Err(Error::Syscall(errno)) if errno == -libc::EINVAL));
    }

    #[test]
    fn arch_prctl_get_fs_reads_back() {
        let mut state = crate::state::GuestCpuState::default();
        arch_prctl(&mut state, ARCH_SET_FS, 0x2000).unwrap();
        assert_eq!(arch_prctl(&mut state, ARCH_GET_FS, 0).unwrap(), 0x2000);
    }
}
