//! Streaming-parallel reader and writer for the OpenStreetMap PBF format.
//!
//! The input stream is walked blob by blob on the calling thread while the
//! blocks are decompressed and decoded on a bounded worker pool, so slow
//! sinks throttle the reader instead of piling blobs up in memory. Sharded
//! construction lets several readers split one file between them. The writer
//! side builds dense-coded primitive blocks with shared string tables and
//! emits the same framed blob stream.
//!
//! # Modules
//!
//! * `models` - Entity types delivered to sinks and accepted by the writer.
//! * `readers` - The parallel parser.
//! * `writers` - The PBF writer.
//! * `codecs` - Blob framing and block level encoding/decoding.
//! * `proto` - Generated protobuf bindings for the PBF schemas.
//!
//! # Example
//!
//! Count the ways of a file with four decode workers:
//!
//! ```no_run
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::Arc;
//!
//! use pbf_parallel::readers::ParallelReader;
//!
//! let ways = Arc::new(AtomicU64::new(0));
//! let counter = Arc::clone(&ways);
//! ParallelReader::from_path("planet.osm.pbf", 4)
//!     .unwrap()
//!     .on_way(move |_| {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     })
//!     .parse()
//!     .unwrap();
//! println!("{} ways", ways.load(Ordering::Relaxed));
//! ```

pub mod codecs;
mod error;
pub mod models;
pub mod readers;
pub mod writers;

/// Generated bindings for `fileformat.proto` and `osmformat.proto`.
pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/mod.rs"));
}

pub use error::{PbfError, Result};
