//! Core types of the render cache: cache identities, tile math, bounding boxes and errors.
//!
//! Everything in this crate is pure. Stores, locking and the cache manager live in the
//! `rendercache` crate.

mod error;
pub use error::*;

pub mod types;
pub use types::*;
