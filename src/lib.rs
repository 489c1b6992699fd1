//! A non-blocking collective communication library for partitioned
//! global address spaces, focusing on cooperatively polled progress,
//! one-sided data movement, and composable completion handles.
//!
//! Collective operations (broadcast, scatter, gather, gather-all,
//! exchange, and their multi-image variants) are submitted as
//! non-blocking operations that return a [`CollHandle`]. Every
//! operation is a small state machine advanced by the poll driver;
//! any thread that synchronizes also drives progress for everyone
//! else. Data moves over a pluggable transport: one-sided RMA for
//! bulk payloads, eager active messages for small ones, and a
//! rendezvous handshake in between.
//!
//! # Example
//!
//! A one-rank "cluster" over the in-process loopback fabric:
//!
//! ```
//! use std::sync::Arc;
//! use pgas_io::{Collectives, Flags, Segment, Team};
//! use pgas_io::transport::loopback::LoopbackFabric;
//!
//! let fabric = LoopbackFabric::new(1);
//! let mut seg = vec![0u8; 4096].into_boxed_slice();
//! let segment = Segment::new(seg.as_mut_ptr(), seg.len());
//!
//! let coll = Collectives::init(Arc::new(fabric.port(0)), segment, &[1], 0, 0, 0);
//! let ctx = coll.attach_thread();
//!
//! let src = [0xAAu8, 0xBB];
//! let mut dst = [0u8; 2];
//! let mut h = unsafe {
//!     ctx.broadcast_nb(Team::ALL, dst.as_mut_ptr(), 0, src.as_ptr(), 2,
//!                      Flags::in_mysync() | Flags::out_mysync() | Flags::single())
//! };
//! ctx.wait_sync(&mut h);
//! assert_eq!(dst, [0xAA, 0xBB]);
//! ```

mod active;
mod agg;
mod coll;
mod consensus;
mod engine;
mod error;
mod flags;
mod handle;
mod op;
mod p2p;
mod segment;
mod team;

pub mod transport;

pub use engine::{CollCtx, Collectives};

pub use error::SyncError;

pub use flags::Flags;

pub use handle::CollHandle;

pub use p2p::{EAGER_MIN, EAGER_SCALE};

pub use segment::Segment;

pub use team::{Image, Rank, Team};

#[cfg(feature = "stats")]
pub use engine::Stats;
