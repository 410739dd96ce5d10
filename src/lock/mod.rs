pub mod sleeplock;
pub mod spinlock;
