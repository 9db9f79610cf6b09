//! Lock-free byte rings for memory shared across a privilege boundary.
//!
//! The two halves of a ring live in different worlds: one side only ever
//! advances the write cursor, the other only the read cursor, and nothing
//! else about the shared bytes is trusted.
//!
//! # Pieces
//!
//! - [`SharedRegion`]: foreign-writable memory, touched only through atomics
//!   and explicit copies
//! - [`CircBufRaw`] / [`CircBuf`]: the ring itself and a side's descriptor
//!   with local cursor shadows and flush/rollback
//! - packet framing ([`CircBuf::write_packet`], [`CircBuf::read_packet`],
//!   [`CircBuf::peek_packet_size`], [`CircBuf::drop_packet`])
//! - [`WriteTxn`] / [`ReadTxn`]: snapshot-and-commit guards for multi-step records
//! - [`Source`] / [`Sink`]: kernel, user (faulting) and discard copy endpoints
//!
//! # Loom Testing
//!
//! Enable the `loom` feature to model-check the cursor publication protocol.
//!
//! ```text
//! cargo test -p iwc-ring --features loom
//! ```

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod circ_buf;
pub mod error;
pub mod io;
pub mod packet;
pub mod region;
pub mod sync;
pub mod txn;

pub use circ_buf::{
    CIRC_BUF_EMPTY_FLAG_SIZE, CIRC_BUF_HEADER_SIZE, CIRC_BUF_META_SIZE, CircBuf, CircBufHeader,
    CircBufRaw, circ_buf_total_size, round_down, round_up,
};
pub use error::RingError;
pub use io::{Sink, Source, UserSlice, UserSliceMut};
pub use packet::{PACKET_HEADER_SIZE, size_for_packet};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::SharedRegion;
pub use txn::{ReadTxn, WriteTxn};

#[cfg(all(test, feature = "loom"))]
mod loom_tests;
