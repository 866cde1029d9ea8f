//! Render cache for map tiles and WMS images.
//!
//! Rendering the same layers and styles twice is expensive, so this crate keeps the
//! results on disk:
//! - every combination of layers, styles, reference system and render options gets a
//!   content-derived [`CacheKey`](rendercache_core::CacheKey),
//! - XYZ tiles are stored in an MBTiles file per key ([`TileStore`]),
//! - ad-hoc WMS images are stored in a spatially indexed file per key ([`ResultStore`]),
//! - a [`CacheDirectory`] records which layers and styles each cache depends on, so the
//!   [`CacheManager`] can invalidate exactly the affected caches.
//!
//! Misses are rendered by a [`Renderer`]. Concurrent misses for one key, in this process or
//! in others sharing the cache directory, render only once.
//!
//! # Quick start
//! ```rust
//! use rendercache::{CacheManager, CacheParams, testing::MockRenderer};
//! use rendercache_core::TileCoord;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dir = std::env::temp_dir().join("rendercache-doc");
//!     let manager = CacheManager::builder()
//!         .cache_dir(&dir)
//!         .renderer(Arc::new(MockRenderer::new()))
//!         .build()?;
//!
//!     let store = manager.get_tile_store(&CacheParams::new(["roads"], ["default"]))?;
//!     let tile = store.fetch(&TileCoord::new(2, 1, 1)?).await?;
//!     assert!(!tile.is_empty());
//!
//!     manager.on_style_modified("default")?;
//!     Ok(())
//! }
//! ```

mod config;
pub use config::*;

mod directory;
pub use directory::*;

mod events;
pub use events::*;

mod file_id;

mod lock;
pub use lock::*;

mod manager;
pub use manager::*;

mod params;
pub use params::*;

mod renderer;
pub use renderer::*;

mod result_store;
pub use result_store::*;

mod runtime;
pub use runtime::*;

mod siblings;
pub use siblings::*;

mod sqlite;

mod tile_store;
pub use tile_store::*;

pub mod testing;
