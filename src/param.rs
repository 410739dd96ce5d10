//! Pool sizes and memory-layout constants.

/// Size of a disk block.
pub const BSIZE: usize = 1024;

/// Maximum number of blocks a filesystem op can write.
pub const MAXOPBLOCKS: usize = 10;

/// Size of the disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Number of hash buckets in the block cache.
pub const NBUCKET: usize = 13;

/// Size of a physical memory page.
pub const PGSIZE: usize = 4096;

/// Upper bound on pages a single allocator instance can manage; sizes the
/// reference-count table. 32768 pages = 128 MiB, the qemu-virt provision.
pub const MAXPAGES: usize = 32768;

/// Fill byte for freshly allocated pages, to surface reads of
/// uninitialized memory.
pub const ALLOC_JUNK: u8 = 5;

/// Fill byte for freed pages, to surface dangling references.
pub const FREE_JUNK: u8 = 1;
