//! Contains types like blobs, bounding boxes, tile coordinates and cache keys.

mod bbox;
pub use bbox::*;

mod blob;
pub use blob::*;

mod cache_key;
pub use cache_key::*;

mod mercator;
pub use mercator::*;

mod tile_bbox;
pub use tile_bbox::*;

mod tile_coord;
pub use tile_coord::*;
