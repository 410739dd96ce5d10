//! Resource-management core of a teaching kernel.
//!
//! Two independent components live here:
//!
//! * [`bio`] — a block buffer cache sharded into hash buckets, each with its
//!   own lock, backed by a fixed pool of buffers recycled with an LRU policy.
//!   Cross-bucket coordination (stealing a free buffer, global eviction) goes
//!   through a single cache-wide lock on the slow path.
//! * [`kalloc`] — a physical page allocator: a freelist threaded through the
//!   free pages themselves, plus a per-page reference count so that pages can
//!   be shared copy-on-write.
//!
//! Both are handed their resources explicitly — the cache takes a
//! [`disk::DiskDriver`] handle, the allocator a raw physical range — so the
//! core runs unchanged under the hosted test harness.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod bio;
pub mod disk;
pub mod kalloc;
pub mod lock;
pub mod param;
