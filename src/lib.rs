//! # Zipmat: compressed column-group matrix blocks for analytics workloads.
//!
//! Large read-mostly numeric matrices are often dominated by a handful of
//! distinct values per column. Zipmat partitions the columns of such a
//! matrix into groups, co-coding columns that share value patterns, and
//! encodes each group as distinct value tuples plus compressed row
//! positions (offset lists or run lengths, whichever is smaller). Kernels
//! like matrix-vector multiply, transpose-self multiply, and unary
//! aggregates run directly on the compressed form, usually touching one
//! scalar per tuple instead of one per cell.
//!
//! Compression is planned from a row sample: per-column size estimates
//! classify columns as amenable or not, a co-coding pass groups the
//! amenable ones, and exact bitmaps correct the sample-based decisions
//! before anything is encoded. Columns that do not pay for compression
//! stay in one uncompressed group. Operations without a compressed kernel
//! decompress and delegate, with a warning.

#![deny(missing_docs)]

/// Transient bitmaps: distinct tuples and their row offsets
pub mod bitmap;

/// Uncompressed matrix blocks, dense or sparse
pub mod block;

/// Co-coding planner
pub(crate) mod cocode;

/// Errors surfaced by compression and kernels
pub mod error;

/// Sample-based compressed-size estimation
pub mod estim;

/// Random block generators for tests and benchmarks
pub mod gen_rand;

/// Column groups and their shared kernels
pub mod group;

/// Compressed matrix blocks and kernel dispatch
pub mod matrix;

/// Offset-list encoded groups
pub mod ole;

/// Operator vocabulary for the compressed kernels
pub mod ops;

/// Run-length encoded groups
pub mod rle;

/// Binary serialization
pub mod ser;

/// Uncompressed column groups
pub mod uncomp;

pub(crate) mod vecmath;

pub use bitmap::BITMAP_BLOCK_SZ;
pub use block::MatrixBlock;
pub use error::ZipError;
pub use group::ColGroup;
pub use matrix::{CompressedMatrix, CompressionStats};
pub use ops::{AggOp, ChainType, ReduceDir, ScalarOp, TsmmSide};
