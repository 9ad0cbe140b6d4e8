//! stripestore engine - core block storage for the stripestore OSD
//!
//! This crate implements the single-node block storage engine:
//! - Fixed-size objects addressed by `(inode, stripe)` and a monotonically
//!   increasing version
//! - A circular write-ahead journal with inline small-write payloads
//! - A flat metadata area holding one slot per data block
//! - A bitmap allocator over the data area
//! - A single-threaded event loop over an async completion ring, with a
//!   cooperative flusher moving synced writes into the data area
//!
//! The engine is callback-driven: build an [`Op`], attach a callback, hand
//! it to [`Blockstore::enqueue`] and drive [`Blockstore::tick`].

pub mod allocator;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod journal;
pub mod meta;
pub mod op;
pub mod ring;
pub mod types;

mod flusher;
mod init;
mod read;
mod stable;
mod sync;
mod write;

// Re-exports
pub use config::{Config, ImmediateCommit, Layout};
pub use engine::{options_from, Blockstore};
pub use error::{EngineError, Result};
pub use op::{Op, OpCode};
pub use types::{CleanEntry, DirtyEntry, DirtyPhase, ObjVer, Oid};
