#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// chessboard pattern detection module.
pub mod chessboard;

/// color transformations module.
pub mod color;

/// saddle point response and peak extraction.
pub mod features;

/// image filtering module.
pub mod filter;

/// utilities for interpolation.
pub mod interpolation;

/// module containing parallization utilities.
pub mod parallel;

/// sub-pixel corner refinement.
pub mod subpix;
