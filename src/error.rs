//! This module provides an `Error` type for the crate using the [`thiserror`] crate.
use crate::fault::GuestFault;
use thiserror::Error;

/// The `Error` type.
#[derive(Debug, Error)]
pub enum Error {
    /// A guest instruction raised a fault that must be delivered to the guest as a signal.
    #[error("guest fault: {0:?}")]
    GuestFault(GuestFault),
    /// A guest syscall failed; the value is the negated errno returned in `RAX`.
    #[error("syscall error: {0}")]
    Syscall(i32),
    /// The on-disk code cache's format tag did not match; the cache was reset.
    #[error("code cache tag mismatch, cache reset")]
    CacheTagMismatch,
    /// The on-disk code cache's data file ran out of chunks.
    #[error("code cache chunk exhaustion")]
    ChunkExhaustion,
    /// A guest resource-allocating operation could not be satisfied.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),
    /// A VMA tracker invariant was violated.
    #[error("VMA invariant violated: {0}")]
    VmaInvariant(&'static str),
    /// Static register allocation spill/fill skew was detected across a world boundary.
    #[error("SRA spill/fill skew detected")]
    SraSkew,
    /// The requested guest address is outside of any known mapping.
    #[error("invalid guest address")]
    InvalidGuestAddress,
    /// The lookup cache could not resolve an aliased entry via RIP comparison.
    #[error("lookup cache alias not resolvable")]
    LookupAliasUnresolvable,
    /// Not implemented.
    #[error("not implemented")]
    NotImplemented,
    /// Wraps [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps [`mmap_rs::Error`].
    #[error(transparent)]
    Mmap(#[from] mmap_rs::error::Error),
    /// Wraps an error that originates from any calls to the [`nix`] crate.
    #[error(transparent)]
    Nix(#[from] nix::Error),
}
