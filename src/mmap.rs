//! JIT code buffers (§4.6 step 6, §9 "On-disk cache file mapping").
//!
//! [`Mmap`]/[`MmapMut`]/[`MmapNone`] wrap `mmap-rs`'s W^X state machine around a single host
//! memory region the block translator (C6) emits AArch64 code into. A buffer starts life mutable
//! (the translator writes into it), is flushed and transitioned to executable once a block is
//! published, and is never both writable and executable at once.

use crate::error::Error;
use std::ops::{Deref, DerefMut};

macro_rules! mmap_impl {
    ($t:ident) => {
        impl $t {
            /// Yields a raw immutable pointer to this buffer.
            #[inline]
            pub fn as_ptr(&self) -> *const u8 {
                self.inner.as_ref().expect("inner must have been present").as_ptr()
            }

            /// Yields the size of this buffer.
            #[inline]
            pub fn size(&self) -> usize {
                self.inner.as_ref().expect("inner must have been present").size()
            }

            /// The host address the dispatcher and C4/C3 should record for this buffer.
            #[inline]
            pub fn host_address(&self) -> u64 {
                self.as_ptr() as u64
            }

            /// Locks the pages in memory such that accessing the buffer causes no page faults.
            pub fn lock(&mut self) -> Result<(), Error> {
                self.inner.as_mut().expect("inner must have been present").lock()?;
                Ok(())
            }

            /// Unlocks the pages, allowing the host kernel to swap them back out.
            pub fn unlock(&mut self) -> Result<(), Error> {
                self.inner.as_mut().expect("inner must have been present").unlock()?;
                Ok(())
            }

            /// Flushes the instruction cache over this buffer's range. AArch64 does not guarantee
            /// coherency between the data and instruction caches the way x86 does, so this must run
            /// after every write and before the buffer is made executable.
            pub fn flush_icache(&self) -> Result<(), Error> {
                self.inner.as_ref().expect("inner must have been present").flush_icache()?;
                Ok(())
            }

            /// Remaps this buffer as inaccessible.
            ///
            /// In case of failure, this returns ownership of `self`.
            pub fn make_none(mut self) -> Result<MmapNone, (Self, Error)> {
                let inner = self.inner.take().expect("inner must have been present");

                let inner = match inner.make_none() {
                    Ok(inner) => inner,
                    Err((inner, e)) => return Err((Self { inner: Some(inner) }, e.into())),
                };

                Ok(MmapNone { inner: Some(inner) })
            }

            /// Remaps this buffer as read-only.
            ///
            /// In case of failure, this returns ownership of `self`.
            pub fn make_read_only(mut self) -> Result<Mmap, (Self, Error)> {
                let inner = self.inner.take().expect("inner must have been present");

                let inner = match inner.make_read_only() {
                    Ok(inner) => inner,
                    Err((inner, e)) => return Err((Self { inner: Some(inner) }, e.into())),
                };

                Ok(Mmap { inner: Some(inner) })
            }

            /// Remaps this buffer as executable. Flushes the instruction cache first.
            ///
            /// In case of failure, this returns ownership of `self`.
            pub fn make_exec(mut self) -> Result<Mmap, (Self, Error)> {
                let inner = self.inner.take().expect("inner must have been present");

                let inner = match inner.make_exec() {
                    Ok(inner) => inner,
                    Err((inner, e)) => return Err((Self { inner: Some(inner) }, e.into())),
                };

                Ok(Mmap { inner: Some(inner) })
            }

            /// Remaps this buffer as executable without flushing the instruction cache first.
            ///
            /// # Safety
            ///
            /// The caller must have already flushed the instruction cache over any range it wrote,
            /// or guarantee the buffer was never written to on this host thread.
            ///
            /// In case of failure, this returns ownership of `self`.
            pub unsafe fn make_exec_no_flush(mut self) -> Result<Mmap, (Self, Error)> {
                let inner = self.inner.take().expect("inner must have been present");

                let inner = match inner.make_exec_no_flush() {
                    Ok(inner) => inner,
                    Err((inner, e)) => return Err((Self { inner: Some(inner) }, e.into())),
                };

                Ok(Mmap { inner: Some(inner) })
            }

            /// Remaps this buffer as mutable, e.g. to append the next block's code.
            ///
            /// In case of failure, this returns ownership of `self`.
            pub fn make_mut(mut self) -> Result<MmapMut, (Self, Error)> {
                let inner = self.inner.take().expect("inner must have been present");

                let inner = match inner.make_mut() {
                    Ok(inner) => inner,
                    Err((inner, e)) => return Err((Self { inner: Some(inner) }, e.into())),
                };

                Ok(MmapMut { inner: Some(inner) })
            }

            /// Remaps this buffer to be both executable and mutable.
            ///
            /// This defeats W^X. It exists only for the rare self-modifying-code guest pattern the
            /// dispatcher's exit-linking patch (§4.5) itself relies on when rewriting a `bl` target
            /// in place; prefer [`Mmap::make_mut`]/[`MmapMut::make_exec`] for everything else.
            ///
            /// # Safety
            ///
            /// The caller is responsible for not introducing a window where guest-influenced bytes
            /// are both writable and executable in a way that could be raced by another thread.
            ///
            /// In case of failure, this returns ownership of `self`.
            pub unsafe fn make_exec_mut(mut self) -> Result<MmapMut, (Self, Error)> {
                let inner = self.inner.take().expect("inner must have been present");

                let inner = match inner.make_exec_mut() {
                    Ok(inner) => inner,
                    Err((inner, e)) => return Err((Self { inner: Some(inner) }, e.into())),
                };

                Ok(MmapMut { inner: Some(inner) })
            }
        }
    };
}

/// An inaccessible code buffer.
pub struct MmapNone {
    inner: Option<mmap_rs::MmapNone>,
}

mmap_impl!(MmapNone);

/// An executable, read-only code buffer; the state a translated block is published in.
pub struct Mmap {
    inner: Option<mmap_rs::Mmap>,
}

mmap_impl!(Mmap);

impl Deref for Mmap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size()) }
    }
}

impl AsRef<[u8]> for Mmap {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size()) }
    }
}

/// A writable code buffer; the state the translator emits bytes into before publishing.
pub struct MmapMut {
    inner: Option<mmap_rs::MmapMut>,
}

mmap_impl!(MmapMut);

impl MmapMut {
    /// Reserves a fresh writable buffer of `size` bytes (rounded up to the host page size by
    /// `mmap-rs`), ready for the emitter to write a block's host code into.
    pub fn reserve(size: usize) -> Result<Self, Error> {
        let inner = mmap_rs::MmapOptions::new().with_size(size).map_mut()?;
        Ok(Self { inner: Some(inner) })
    }

    /// Yields a raw mutable pointer to this buffer.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.inner.as_mut().expect("inner must have been present").as_mut_ptr()
    }
}

impl Deref for MmapMut {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size()) }
    }
}

impl DerefMut for MmapMut {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size()) }
    }
}

impl AsRef<[u8]> for MmapMut {
    fn as_ref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size()) }
    }
}

impl AsMut<[u8]> for MmapMut {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_then_write_then_make_exec_round_trips_bytes() {
        let mut buf = MmapMut::reserve(4096).unwrap();
        buf.as_mut()[..4].copy_from_slice(&[0xd6, 0x03, 0x20, 0x03]); // ret; nop, arbitrary bytes.

        let exec = buf.make_exec().unwrap();
        assert_eq!(&exec.as_ref()[..4], &[0xd6, 0x03, 0x20, 0x03]);
    }

    #[test]
    fn host_address_matches_the_underlying_pointer() {
        let buf = MmapMut::reserve(4096).unwrap();
        assert_eq!(buf.host_address(), buf.as_ptr() as u64);
    }
}
