//! Disk transfer boundary.
//!
//! The driver that actually moves blocks lives outside this crate; the
//! buffer cache only needs a synchronous transfer primitive. The cache is
//! the sole caller and always invokes it with the buffer's content lock
//! held — and no bookkeeping lock held.

use crate::bio::BufData;

/// A synchronous block device.
pub trait DiskDriver: Send + Sync {
    /// Transfer one block between `data` and block `blockno` of device
    /// `dev`. Writes `data` out when `writing` is true, fills it from disk
    /// otherwise. Returns only once the transfer is complete.
    fn rw(&self, dev: u32, blockno: u32, data: &mut BufData, writing: bool);
}
