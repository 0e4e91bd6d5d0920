//! Named shared-memory segments.
//!
//! There is no locking between handles. Two processes writing the same segment, or
//! one writing while another reads, must coordinate out of band (a named semaphore,
//! a bus message, a file lock). Reads and writes always start at offset 0.

mod native;
mod segment;

pub use nix::sys::stat::Mode;
pub use segment::SharedMemory;

/// Longest segment name accepted by `create`/`open`, in bytes.
pub const SEGMENT_NAME_MAX: usize = 32;
