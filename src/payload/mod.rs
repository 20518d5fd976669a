//! Payload formats carried in the tail of a cast artifact.
//!
//! - [`trailer`] - fixed 56-byte section table at the end of the artifact
//! - [`sparse`] - compact encoding for mostly-empty filesystem images
//! - [`metadata`] - workload defaults, stored as sorted-key JSON
//! - [`io`] - bounded-chunk copy helpers shared by both directions

pub mod io;
pub mod metadata;
pub mod sparse;
pub mod trailer;

pub use metadata::{ImageConfig, Metadata, MetadataOptions, MAX_METADATA_SIZE};
pub use sparse::{Region, SparseRegionSet, BLOCK_SIZE};
pub use trailer::{Section, Trailer, TRAILER_MAGIC, TRAILER_SIZE};
