//! The entry point of the crate.
//!
//! A [`CacheManager`] derives cache identities, opens stores on demand (at most one handle
//! per identity), keeps the [`CacheDirectory`] up to date and runs invalidations.
//!
//! ```no_run
//! use rendercache::{CacheManager, CacheParams, testing::MockRenderer};
//! use rendercache_core::TileCoord;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let manager = CacheManager::builder()
//! 	.cache_dir("/var/cache/rendercache")
//! 	.renderer(Arc::new(MockRenderer::new()))
//! 	.build()?;
//!
//! let store = manager.get_tile_store(&CacheParams::new(["roads"], ["default"]))?;
//! let tile = store.fetch(&TileCoord::new(3, 4, 2)?).await?;
//!
//! manager.on_layer_modified("roads")?;
//! # Ok(())
//! # }
//! ```

mod builder;

pub use builder::CacheManagerBuilder;

use crate::{
	CacheConfig, CacheDirectory, CacheEntry, CacheKind, CacheParams, CacheRef, CacheRuntime, Event, EventBus,
	ResultStore, SiblingKind, TileStore, remove_siblings, sqlite,
};
use anyhow::{Context, Result};
use dashmap::DashMap;
use itertools::Itertools;
use rendercache_core::{BBox, CacheKey, STANDARD_SRS, normalize_srs};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};

/// Cheap to clone. Clones share stores, directory and events.
#[derive(Clone)]
pub struct CacheManager {
	inner: Arc<ManagerInner>,
}

struct ManagerInner {
	runtime: CacheRuntime,
	directory: CacheDirectory,
	tile_stores: DashMap<CacheKey, Arc<TileStore>>,
	result_stores: DashMap<CacheKey, Arc<ResultStore>>,
}

impl CacheManager {
	pub fn builder() -> CacheManagerBuilder {
		CacheManagerBuilder::new()
	}

	fn new(runtime: CacheRuntime) -> Result<CacheManager> {
		let directory = CacheDirectory::open(runtime.config(), runtime.events().clone())?;
		Ok(CacheManager {
			inner: Arc::new(ManagerInner {
				runtime,
				directory,
				tile_stores: DashMap::new(),
				result_stores: DashMap::new(),
			}),
		})
	}

	pub fn config(&self) -> &CacheConfig {
		self.inner.runtime.config()
	}

	pub fn events(&self) -> &EventBus {
		self.inner.runtime.events()
	}

	pub fn runtime(&self) -> &CacheRuntime {
		&self.inner.runtime
	}

	pub fn directory(&self) -> &CacheDirectory {
		&self.inner.directory
	}

	fn cache_dir(&self) -> &Path {
		&self.config().cache_dir
	}

	/// Returns the tile store of `params`, creating the file and its directory entry on
	/// first use. Concurrent callers receive the same handle.
	///
	/// A handle whose cache was removed meanwhile, by this manager or by another one sharing
	/// the cache directory, is replaced by a fresh store. A missing directory entry is
	/// restored. Fetch the store per request rather than keeping the handle.
	pub fn get_tile_store(&self, params: &CacheParams) -> Result<Arc<TileStore>> {
		let key = params.key()?;
		if let Some(store) = self.inner.tile_stores.get(&key).map(|s| s.clone()) {
			if store.is_current()? {
				self.ensure_registered(&key, CacheKind::Tile, params)?;
				return Ok(store);
			}
			log::debug!("tile store {key} was removed, reopening");
			self.inner.tile_stores.remove_if(&key, |_, memo| Arc::ptr_eq(memo, &store));
			// the old pool must close before a new journal exists under the same name
			drop(store);
		}
		let store = self
			.inner
			.tile_stores
			.entry(key.clone())
			.or_try_insert_with(|| -> Result<Arc<TileStore>> {
				let store = TileStore::open(params, self.inner.runtime.clone())?;
				self.register(&key, CacheKind::Tile, params)?;
				Ok(Arc::new(store))
			})
			.with_context(|| format!("opening tile store {key}"))?;
		Ok(store.clone())
	}

	/// Like [`CacheManager::get_tile_store`], for WMS results.
	pub fn get_result_store(&self, params: &CacheParams) -> Result<Arc<ResultStore>> {
		let key = params.key()?;
		if let Some(store) = self.inner.result_stores.get(&key).map(|s| s.clone()) {
			if store.is_current()? {
				self.ensure_registered(&key, CacheKind::Result, params)?;
				return Ok(store);
			}
			log::debug!("result store {key} was removed, reopening");
			self.inner.result_stores.remove_if(&key, |_, memo| Arc::ptr_eq(memo, &store));
			// the old pool must close before a new journal exists under the same name
			drop(store);
		}
		let store = self
			.inner
			.result_stores
			.entry(key.clone())
			.or_try_insert_with(|| -> Result<Arc<ResultStore>> {
				let store = ResultStore::open(params, self.inner.runtime.clone())?;
				self.register(&key, CacheKind::Result, params)?;
				Ok(Arc::new(store))
			})
			.with_context(|| format!("opening result store {key}"))?;
		Ok(store.clone())
	}

	fn register(&self, key: &CacheKey, kind: CacheKind, params: &CacheParams) -> Result<()> {
		self.inner
			.directory
			.register(key, kind, &params.srs, &params.layers, &params.styles)
	}

	fn ensure_registered(&self, key: &CacheKey, kind: CacheKind, params: &CacheParams) -> Result<()> {
		if self.inner.directory.is_registered(key, kind)? {
			return Ok(());
		}
		log::debug!("restoring directory entry of {key}");
		self.register(key, kind, params)
	}

	/// Deletes the tile store file of `params` and opens a fresh one. This is the way out of
	/// [`CacheError::StoreUnavailable`](rendercache_core::CacheError::StoreUnavailable).
	pub fn recreate_tile_store(&self, params: &CacheParams) -> Result<Arc<TileStore>> {
		let key = params.key()?;
		self.inner.tile_stores.remove(&key);
		let removed = sqlite::remove_database(&SiblingKind::TileStore.path(self.cache_dir(), &key))?;
		log::debug!("recreating tile store {key}, removed {removed} files");
		self.get_tile_store(params)
	}

	/// Deletes the result store file of `params` and opens a fresh one.
	pub fn recreate_result_store(&self, params: &CacheParams) -> Result<Arc<ResultStore>> {
		let key = params.key()?;
		self.inner.result_stores.remove(&key);
		let removed = sqlite::remove_database(&SiblingKind::ResultStore.path(self.cache_dir(), &key))?;
		log::debug!("recreating result store {key}, removed {removed} files");
		self.get_result_store(params)
	}

	/// Removes every cache depending on `layer`: all sibling files, open handles and
	/// directory rows. Returns the removed identities.
	pub fn remove_caches_for_layer(&self, layer: &str) -> Result<Vec<CacheKey>> {
		let caches = self.inner.directory.caches_for_layer(layer)?;
		self.remove_caches(caches.into_iter().map(|cache| cache.key))
	}

	/// Like [`CacheManager::remove_caches_for_layer`], for a style.
	pub fn remove_caches_for_style(&self, style: &str) -> Result<Vec<CacheKey>> {
		let caches = self.inner.directory.caches_for_style(style)?;
		self.remove_caches(caches.into_iter().map(|cache| cache.key))
	}

	/// Removes every cache depending on any of `layers` or `styles`.
	pub fn trim_cache(&self, layers: &[&str], styles: &[&str]) -> Result<Vec<CacheKey>> {
		let mut keys = Vec::new();
		for layer in layers {
			keys.extend(self.inner.directory.caches_for_layer(layer)?.into_iter().map(|c| c.key));
		}
		for style in styles {
			keys.extend(self.inner.directory.caches_for_style(style)?.into_iter().map(|c| c.key));
		}
		self.remove_caches(keys.into_iter().unique())
	}

	/// Removes every cache depending on any layer of a resource.
	pub fn remove_caches_for_resource(&self, layers: &[&str]) -> Result<Vec<CacheKey>> {
		self.trim_cache(layers, &[])
	}

	fn remove_caches(&self, keys: impl IntoIterator<Item = CacheKey>) -> Result<Vec<CacheKey>> {
		let mut removed = Vec::new();
		for key in keys {
			self.inner.tile_stores.remove(&key);
			self.inner.result_stores.remove(&key);
			remove_siblings(self.cache_dir(), &key)?;
			self.inner.directory.remove(&key)?;
			log::debug!("removed cache {key}");
			self.events().emit(Event::CacheRemoved { cache: key.clone() });
			removed.push(key);
		}
		Ok(removed)
	}

	/// Deletes cached entries intersecting `bbox` (EPSG:3857 meters) from every cache
	/// depending on any of `layers`. Returns the number of deleted tiles and images.
	pub fn shave_caches(&self, layers: &[&str], bbox: &BBox) -> Result<u64> {
		let caches = self.caches_for_layers(layers)?;
		let mut removed = 0;
		for cache in caches {
			if cache.kind.has_tiles() {
				removed += self.shave_tile_store(&cache.key, bbox)?;
			}
			if cache.kind.has_results() {
				removed += self.shave_result_store(&cache, bbox)?;
			}
		}
		Ok(removed)
	}

	fn shave_tile_store(&self, key: &CacheKey, bbox: &BBox) -> Result<u64> {
		if let Some(store) = self.inner.tile_stores.get(key).map(|s| s.clone())
			&& store.is_current()?
		{
			return store.shave(bbox);
		}
		let path = SiblingKind::TileStore.path(self.cache_dir(), key);
		if !path.exists() {
			return Ok(0);
		}
		let removed = TileStore::shave_path(&path, bbox, self.config())?;
		self.events().emit(Event::CacheShaved {
			cache: key.clone(),
			removed,
		});
		Ok(removed)
	}

	fn shave_result_store(&self, cache: &CacheRef, bbox: &BBox) -> Result<u64> {
		let srs = normalize_srs(&cache.srs);
		let bbox = if srs == STANDARD_SRS {
			*bbox
		} else if srs == "+init=epsg:4326" {
			bbox.mercator_to_geo()
		} else {
			log::debug!("cache {} uses '{}', shaving all of it", cache.key, cache.srs);
			BBox::new(-f64::MAX, -f64::MAX, f64::MAX, f64::MAX)?
		};

		if let Some(store) = self.inner.result_stores.get(&cache.key).map(|s| s.clone())
			&& store.is_current()?
		{
			return store.shave(&bbox);
		}
		let path = SiblingKind::ResultStore.path(self.cache_dir(), &cache.key);
		if !path.exists() {
			return Ok(0);
		}
		let removed = ResultStore::shave_path(&path, &bbox, self.config())?;
		self.events().emit(Event::CacheShaved {
			cache: cache.key.clone(),
			removed,
		});
		Ok(removed)
	}

	fn caches_for_layers(&self, layers: &[&str]) -> Result<Vec<CacheRef>> {
		let mut caches = Vec::new();
		for layer in layers {
			caches.extend(self.inner.directory.caches_for_layer(layer)?);
		}
		Ok(caches.into_iter().unique_by(|cache| cache.key.clone()).collect())
	}

	/// Bytes on disk of the tile stores depending on `layer`, journals included.
	pub fn layer_cache_size(&self, layer: &str) -> Result<u64> {
		self.resource_cache_size(&[layer])
	}

	/// Bytes on disk of the tile stores depending on any of `layers`. Each store counts once.
	pub fn resource_cache_size(&self, layers: &[&str]) -> Result<u64> {
		let mut size = 0;
		for cache in self.caches_for_layers(layers)? {
			if !cache.kind.has_tiles() {
				continue;
			}
			let path = SiblingKind::TileStore.path(self.cache_dir(), &cache.key);
			size += file_size(&path)?;
			size += file_size(&path.with_extension("mbtiles-wal"))?;
		}
		Ok(size)
	}

	/// All caches in the directory.
	pub fn list_caches(&self) -> Result<Vec<CacheEntry>> {
		self.inner.directory.entries()
	}

	/// Hook for changed layer definitions or data: removes the layer's caches.
	pub fn on_layer_modified(&self, layer: &str) -> Result<Vec<CacheKey>> {
		log::debug!("layer '{layer}' modified");
		self.remove_caches_for_layer(layer)
	}

	/// Hook for changed styles: removes the style's caches.
	pub fn on_style_modified(&self, style: &str) -> Result<Vec<CacheKey>> {
		log::debug!("style '{style}' modified");
		self.remove_caches_for_style(style)
	}

	/// Hook for a local data edit: shaves `bbox` (EPSG:3857 meters) off the layer's caches.
	pub fn on_geometry_edited(&self, layer: &str, bbox: &BBox) -> Result<u64> {
		log::debug!("geometry of '{layer}' edited in {bbox:?}");
		self.shave_caches(&[layer], bbox)
	}
}

impl std::fmt::Debug for CacheManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheManager")
			.field("runtime", &self.inner.runtime)
			.field("tile_stores", &self.inner.tile_stores.len())
			.field("result_stores", &self.inner.result_stores.len())
			.finish()
	}
}

fn file_size(path: &Path) -> Result<u64> {
	match fs::metadata(path) {
		Ok(metadata) => Ok(metadata.len()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
		Err(e) => Err(e).with_context(|| format!("reading size of '{}'", path.display())),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MockRenderer;
	use assert_fs::TempDir;
	use pretty_assertions::assert_eq;
	use rendercache_core::{CacheError, TileCoord};
	use std::sync::Mutex;

	fn manager(renderer: MockRenderer) -> (TempDir, Arc<MockRenderer>, CacheManager) {
		let dir = TempDir::new().unwrap();
		let renderer = Arc::new(renderer);
		let manager = CacheManager::builder()
			.cache_dir(dir.path())
			.renderer(renderer.clone())
			.build()
			.unwrap();
		(dir, renderer, manager)
	}

	fn files(dir: &TempDir) -> Vec<String> {
		let mut names: Vec<String> = fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().into_string().unwrap())
			.filter(|name| !name.starts_with("directory.sqlite"))
			.collect();
		names.sort();
		names
	}

	#[test]
	fn handles_are_memoized() {
		let (_dir, _renderer, manager) = manager(MockRenderer::new());
		let params = CacheParams::new(["roads"], ["default"]);
		let a = manager.get_tile_store(&params).unwrap();
		let b = manager.clone().get_tile_store(&params).unwrap();
		assert!(Arc::ptr_eq(&a, &b));

		let entries = manager.list_caches().unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].key, params.key().unwrap());
		assert_eq!(entries[0].kind, CacheKind::Tile);
		assert_eq!(entries[0].layers, vec![String::from("roads")]);

		manager.get_result_store(&params).unwrap();
		assert_eq!(manager.list_caches().unwrap()[0].kind, CacheKind::Both);
	}

	#[tokio::test]
	async fn removed_caches_are_reopened() {
		let (dir, renderer, manager) = manager(MockRenderer::new());
		let params = CacheParams::new(["roads"], ["default"]);
		let key = params.key().unwrap();
		let coord = TileCoord::new(3, 4, 2).unwrap();
		let store = manager.get_tile_store(&params).unwrap();
		store.fetch(&coord).await.unwrap();

		manager.directory().remove(&key).unwrap();
		let same = manager.get_tile_store(&params).unwrap();
		assert!(Arc::ptr_eq(&store, &same));
		assert_eq!(manager.list_caches().unwrap().len(), 1);

		remove_siblings(dir.path(), &key).unwrap();
		assert!(!store.is_current().unwrap());
		let old = Arc::downgrade(&store);
		drop((store, same));
		let fresh = manager.get_tile_store(&params).unwrap();
		assert!(old.upgrade().is_none());
		assert!(fresh.is_current().unwrap());
		assert_eq!(fresh.get_tile(&coord).unwrap(), None);
		fresh.fetch(&coord).await.unwrap();
		assert_eq!(renderer.calls(), 2);
	}

	#[tokio::test]
	async fn remove_for_style_keeps_others() {
		let (dir, _renderer, manager) = manager(MockRenderer::new());
		let day = CacheParams::new(["roads"], ["day"]);
		let night = CacheParams::new(["roads"], ["night"]);
		let coord = TileCoord::new(1, 0, 0).unwrap();
		manager.get_tile_store(&day).unwrap().fetch(&coord).await.unwrap();
		manager.get_tile_store(&night).unwrap().fetch(&coord).await.unwrap();

		let removed = manager.remove_caches_for_style("night").unwrap();
		assert_eq!(removed, vec![night.key().unwrap()]);
		assert!(files(&dir).iter().all(|f| f.starts_with(day.key().unwrap().as_str())));
		assert_eq!(manager.list_caches().unwrap().len(), 1);
		assert!(manager.remove_caches_for_style("night").unwrap().is_empty());
	}

	#[tokio::test]
	async fn trim_removes_each_cache_once() {
		let (dir, _renderer, manager) = manager(MockRenderer::new());
		let events = Arc::new(Mutex::new(0));
		let counter = events.clone();
		manager.events().subscribe(move |event| {
			if matches!(event, Event::CacheRemoved { .. }) {
				*counter.lock().unwrap() += 1;
			}
		});

		let parks = CacheParams::new(["parks"], ["green"]);
		for params in [
			CacheParams::new(["roads", "rivers"], ["default"]),
			CacheParams::new(["rivers"], ["blue"]),
			parks.clone(),
		] {
			manager.get_tile_store(&params).unwrap();
		}

		let removed = manager.trim_cache(&["roads", "rivers"], &["default"]).unwrap();
		assert_eq!(removed.len(), 2);
		assert_eq!(*events.lock().unwrap(), 2);
		let parks_key = parks.key().unwrap();
		assert!(files(&dir).iter().all(|f| f.starts_with(parks_key.as_str())));
		assert_eq!(manager.remove_caches_for_resource(&["parks"]).unwrap().len(), 1);
		assert!(files(&dir).is_empty());
	}

	#[tokio::test]
	async fn shave_open_and_closed_stores() {
		let (dir, renderer, manager) = manager(MockRenderer::new());
		let params = CacheParams::new(["roads"], ["default"]);
		let coord = TileCoord::new(2, 1, 1).unwrap();
		manager.get_tile_store(&params).unwrap().fetch(&coord).await.unwrap();
		let bbox = coord.to_mercator_bbox();

		assert_eq!(manager.on_geometry_edited("roads", &bbox).unwrap(), 1);
		assert_eq!(manager.on_geometry_edited("rivers", &bbox).unwrap(), 0);
		manager.get_tile_store(&params).unwrap().fetch(&coord).await.unwrap();
		assert_eq!(renderer.calls(), 2);

		let reopened = CacheManager::builder()
			.cache_dir(dir.path())
			.renderer(renderer.clone())
			.build()
			.unwrap();
		assert_eq!(reopened.shave_caches(&["roads"], &bbox).unwrap(), 1);
	}

	#[tokio::test]
	async fn shave_geographic_results() {
		let (_dir, _renderer, manager) = manager(MockRenderer::new());
		let params = CacheParams::new(["parcels"], ["outline"]).srs("EPSG:4326");
		let store = manager.get_result_store(&params).unwrap();
		store
			.fetch("png", 256, 256, &BBox::new(10.0, 50.0, 11.0, 51.0).unwrap())
			.await
			.unwrap();
		store
			.fetch("png", 256, 256, &BBox::new(-80.0, 30.0, -79.0, 31.0).unwrap())
			.await
			.unwrap();

		let edit = BBox::new_geo(10.5, 50.5, 10.6, 50.6).unwrap().to_mercator();
		assert_eq!(manager.shave_caches(&["parcels"], &edit).unwrap(), 1);
		assert_eq!(store.len().unwrap(), 1);
	}

	#[tokio::test]
	async fn sizes_count_tile_stores() {
		let (_dir, _renderer, manager) = manager(MockRenderer::new());
		assert_eq!(manager.layer_cache_size("roads").unwrap(), 0);

		let shared = CacheParams::new(["roads", "rivers"], ["default"]);
		let roads = CacheParams::new(["roads"], ["default"]);
		for params in [&shared, &roads] {
			let store = manager.get_tile_store(params).unwrap();
			store.fetch(&TileCoord::new(0, 0, 0).unwrap()).await.unwrap();
		}

		let roads_size = manager.layer_cache_size("roads").unwrap();
		let rivers_size = manager.layer_cache_size("rivers").unwrap();
		assert!(rivers_size > 0);
		assert!(roads_size > rivers_size);
		assert_eq!(manager.resource_cache_size(&["roads", "rivers"]).unwrap(), roads_size);
	}

	#[test]
	fn unavailable_until_recreated() {
		let (dir, _renderer, manager) = manager(MockRenderer::new());
		let params = CacheParams::new(["roads"], ["default"]);
		let path = SiblingKind::TileStore.path(dir.path(), &params.key().unwrap());
		fs::write(&path, b"garbage".repeat(1000)).unwrap();

		let err = manager.get_tile_store(&params).unwrap_err();
		assert!(matches!(CacheError::classify(&err), Some(CacheError::StoreUnavailable { .. })));
		assert_eq!(fs::read(&path).unwrap(), b"garbage".repeat(1000));
		assert!(manager.list_caches().unwrap().is_empty());

		let store = manager.recreate_tile_store(&params).unwrap();
		assert_eq!(store.tile_count().unwrap(), 0);
		assert_eq!(manager.list_caches().unwrap().len(), 1);
	}
}
