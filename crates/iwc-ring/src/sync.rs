#[cfg(not(feature = "loom"))]
pub use core::sync::atomic::{AtomicU32, Ordering, fence};
#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU32, Ordering, fence};

#[cfg(feature = "loom")]
pub use loom::thread;
#[cfg(all(not(feature = "loom"), any(test, feature = "std")))]
pub use std::thread;
