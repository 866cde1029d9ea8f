//! Render-on-miss tile cache in an MBTiles (SQLite) file.
//!
//! Every [`TileStore`] owns one file `<identity>.mbtiles`. The schema is the "deduplicated"
//! MBTiles layout: image blobs live in `images`, addressed from `map`, and the `tiles`
//! view joins both for third-party readers. UTFGrid tables exist but stay empty.
//!
//! Rows are stored in the **TMS layout** (`tile_row = 2^z - 1 - y`); the API uses XYZ rows.
//!
//! A tile is rendered at most once per store: a miss takes the store's async mutex and the
//! cross-process [`RenderLock`], then re-reads the store before invoking the renderer. Renders
//! of one store are therefore serialized, also while seeding.
//! Rendered tiles not larger than the blank threshold are returned but never written.

use crate::{
	CacheConfig, CacheParams, CacheRuntime, Event, RenderLock, RenderRequest, SiblingKind, file_id::FileId, sqlite,
};
use anyhow::{Context, Result, bail, ensure};
use futures::{StreamExt, TryStreamExt, stream};
use r2d2_sqlite::rusqlite::{Connection, OptionalExtension, params};
use rendercache_core::{BBox, Blob, CacheError, CacheKey, MAX_MERCATOR_LAT, STANDARD_SRS, TileBBox, TileCoord, normalize_srs};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const SCHEMA: &str = "
	CREATE TABLE android_metadata (locale TEXT);
	CREATE TABLE grid_key (grid_id TEXT, key_name TEXT);
	CREATE TABLE grid_utfgrid (grid_id TEXT, grid_utfgrid BLOB);
	CREATE TABLE keymap (key_name TEXT, key_json TEXT);
	CREATE TABLE images (tile_data BLOB, tile_id TEXT);
	CREATE TABLE map (zoom_level INTEGER, tile_column INTEGER, tile_row INTEGER, tile_id TEXT, grid_id TEXT);
	CREATE TABLE metadata (name TEXT, value TEXT);
	CREATE VIEW tiles AS
		SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column, map.tile_row AS tile_row, images.tile_data AS tile_data
		FROM map JOIN images ON images.tile_id = map.tile_id
		ORDER BY zoom_level, tile_column, tile_row;
	CREATE VIEW grids AS
		SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column, map.tile_row AS tile_row, grid_utfgrid.grid_utfgrid AS grid
		FROM map JOIN grid_utfgrid ON grid_utfgrid.grid_id = map.grid_id;
	CREATE VIEW grid_data AS
		SELECT map.zoom_level AS zoom_level, map.tile_column AS tile_column, map.tile_row AS tile_row, keymap.key_name AS key_name, keymap.key_json AS key_json
		FROM map JOIN grid_key ON map.grid_id = grid_key.grid_id JOIN keymap ON grid_key.key_name = keymap.key_name;
	CREATE UNIQUE INDEX grid_key_lookup ON grid_key (grid_id, key_name);
	CREATE UNIQUE INDEX grid_utfgrid_lookup ON grid_utfgrid (grid_id);
	CREATE UNIQUE INDEX keymap_lookup ON keymap (key_name);
	CREATE UNIQUE INDEX images_id ON images (tile_id);
	CREATE UNIQUE INDEX map_index ON map (zoom_level, tile_column, tile_row);
	CREATE UNIQUE INDEX name ON metadata (name);
";

const REQUIRED_OBJECTS: [&str; 4] = ["images", "map", "metadata", "tiles"];

/// An open tile cache for one [`CacheKey`].
pub struct TileStore {
	key: CacheKey,
	path: PathBuf,
	lock_path: PathBuf,
	params: CacheParams,
	file_id: FileId,
	pool: sqlite::SqlitePool,
	runtime: CacheRuntime,
	render_mutex: Mutex<()>,
}

impl TileStore {
	/// Opens the store of `params` in the runtime's cache directory, creating it if needed.
	///
	/// An existing file that cannot be opened or lacks the MBTiles tables fails with
	/// [`CacheError::StoreUnavailable`]; it is never replaced implicitly.
	pub fn open(params: &CacheParams, runtime: CacheRuntime) -> Result<TileStore> {
		let key = params.key()?;
		let dir = &runtime.config().cache_dir;
		TileStore::open_path(&SiblingKind::TileStore.path(dir, &key), key, params, runtime)
	}

	/// Like [`TileStore::open`], with an explicit file location.
	pub fn open_path(path: &Path, key: CacheKey, params: &CacheParams, runtime: CacheRuntime) -> Result<TileStore> {
		log::debug!("open tile store {path:?}");
		ensure!(
			normalize_srs(&params.srs) == STANDARD_SRS,
			"tile stores render in Web Mercator, not in '{}'",
			params.srs
		);

		let format = runtime.config().tile_format.clone();
		sqlite::create_atomically(path, |conn| init_schema(conn, params, &format))?;
		sqlite::check_schema(path, &REQUIRED_OBJECTS)?;
		let file_id = sqlite::file_id(path)?;
		let pool = sqlite::open_pool(path, runtime.config()).map_err(|e| {
			let reason = format!("{e:#}");
			e.context(CacheError::store_unavailable(path, reason))
		})?;

		let lock_path = path.with_extension(SiblingKind::Lock.extension());
		Ok(TileStore {
			key,
			path: path.to_path_buf(),
			lock_path,
			params: params.clone(),
			file_id,
			pool,
			runtime,
			render_mutex: Mutex::new(()),
		})
	}

	pub fn key(&self) -> &CacheKey {
		&self.key
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn params(&self) -> &CacheParams {
		&self.params
	}

	/// Whether the file this store was opened on is still in place. A store whose cache was
	/// removed, possibly by another process, keeps working on the deleted file.
	pub fn is_current(&self) -> Result<bool> {
		self.file_id.is_at(&self.path)
	}

	/// Reads a tile without rendering.
	pub fn get_tile(&self, coord: &TileCoord) -> Result<Option<Blob>> {
		let conn = self.pool.get()?;
		let data = conn
			.query_row(
				"SELECT tile_data FROM images WHERE tile_id = ?1",
				[coord.tile_id()],
				|row| row.get::<_, Vec<u8>>(0),
			)
			.optional()
			.with_context(|| format!("reading tile {coord} from '{}'", self.path.display()))?;
		Ok(data.map(Blob::from))
	}

	/// Returns a tile, rendering it on a miss.
	pub async fn fetch(&self, coord: &TileCoord) -> Result<Blob> {
		if let Some(blob) = self.get_tile(coord)? {
			log::trace!("hit {coord} in {}", self.key);
			return Ok(blob);
		}

		let _guard = self.render_mutex.lock().await;
		if let Some(blob) = self.get_tile(coord)? {
			return Ok(blob);
		}
		let _lock = RenderLock::acquire(&self.lock_path, &self.runtime.lock_options()).await?;
		if let Some(blob) = self.get_tile(coord)? {
			return Ok(blob);
		}

		self.render(coord).await
	}

	async fn render(&self, coord: &TileCoord) -> Result<Blob> {
		log::debug!("render {coord} for {}", self.key);
		self.runtime.events().emit(Event::TileRenderRequested {
			cache: self.key.clone(),
			coord: *coord,
			layers: self.params.layers.clone(),
			styles: self.params.styles.clone(),
		});

		let config = self.runtime.config();
		let request = RenderRequest {
			format: config.tile_format.clone(),
			width: config.tile_size,
			height: config.tile_size,
			bbox: coord.to_mercator_bbox(),
			srs: STANDARD_SRS.to_string(),
			styles: self.params.styles.clone(),
			layers: self.params.layers.clone(),
			bgcolor: self.params.bgcolor.clone(),
			transparent: self.params.transparent,
			query: self.params.query.clone(),
		};

		let blob = self
			.runtime
			.renderer()
			.render(&request)
			.await
			.map_err(|e| e.context(CacheError::RenderFailure(format!("tile {coord} of cache {}", self.key))))?;
		if blob.is_empty() {
			bail!(CacheError::RenderFailure(format!(
				"renderer returned no data for tile {coord} of cache {}",
				self.key
			)));
		}

		if blob.len() > config.blank_threshold {
			self.insert_tile(coord, &blob)?;
		} else {
			log::trace!("not storing blank tile {coord} ({} bytes)", blob.len());
		}
		Ok(blob)
	}

	/// Writes `images` and `map` rows in one transaction and keeps the zoom range in
	/// `metadata` current.
	fn insert_tile(&self, coord: &TileCoord, blob: &Blob) -> Result<()> {
		let mut conn = self.pool.get()?;
		let transaction = conn.transaction()?;
		let tile_id = coord.tile_id();
		transaction.execute(
			"INSERT OR REPLACE INTO images (tile_id, tile_data) VALUES (?1, ?2)",
			params![tile_id, blob.as_slice()],
		)?;
		transaction.execute(
			"INSERT OR REPLACE INTO map (tile_id, zoom_level, tile_column, tile_row, grid_id) VALUES (?1, ?2, ?3, ?4, '')",
			params![tile_id, coord.level, coord.x, coord.tms_row()],
		)?;
		transaction.execute_batch(
			"INSERT OR REPLACE INTO metadata (name, value) SELECT 'minzoom', MIN(zoom_level) FROM map;
			INSERT OR REPLACE INTO metadata (name, value) SELECT 'maxzoom', MAX(zoom_level) FROM map;",
		)?;
		transaction
			.commit()
			.with_context(|| format!("storing tile {coord} in '{}'", self.path.display()))?;
		Ok(())
	}

	/// Renders every missing tile between `min_zoom` and `max_zoom` that intersects the
	/// geographic `bbox`. Existing tiles are left alone, so an interrupted seed can simply be
	/// restarted. Returns the number of visited tiles.
	pub async fn seed(&self, min_zoom: u8, max_zoom: u8, bbox: &BBox) -> Result<u64> {
		ensure!(min_zoom <= max_zoom, "min_zoom ({min_zoom}) must be <= max_zoom ({max_zoom})");
		let ranges = (min_zoom..=max_zoom)
			.map(|zoom| TileBBox::from_geo(zoom, bbox))
			.collect::<Result<Vec<_>>>()?;
		let total: u64 = ranges.iter().map(TileBBox::count_tiles).sum();
		log::debug!("seed {total} tiles of {} in {bbox:?}", self.key);

		let concurrency = self.runtime.config().seed_concurrency.max(1);
		stream::iter(ranges.iter().flat_map(TileBBox::iter_coords))
			.map(|coord| async move { self.fetch(&coord).await.map(|_| ()) })
			.buffer_unordered(concurrency)
			.try_collect::<()>()
			.await?;
		Ok(total)
	}

	/// Deletes all tiles intersecting `bbox`, given in Web Mercator meters, at every zoom
	/// level present in the store. Returns the number of deleted tiles.
	pub fn shave(&self, bbox: &BBox) -> Result<u64> {
		let mut conn = self.pool.get()?;
		let removed = shave_tiles(&mut conn, bbox).with_context(|| format!("shaving '{}'", self.path.display()))?;
		self.runtime.events().emit(Event::CacheShaved {
			cache: self.key.clone(),
			removed,
		});
		Ok(removed)
	}

	/// [`TileStore::shave`] for a store that is not open.
	pub fn shave_path(path: &Path, bbox: &BBox, config: &CacheConfig) -> Result<u64> {
		sqlite::check_schema(path, &REQUIRED_OBJECTS)?;
		let mut conn = sqlite::open_connection(path, config)?;
		shave_tiles(&mut conn, bbox).with_context(|| format!("shaving '{}'", path.display()))
	}

	pub fn tile_count(&self) -> Result<u64> {
		let conn = self.pool.get()?;
		let count: i64 = conn.query_row("SELECT COUNT(*) FROM map", [], |row| row.get(0))?;
		Ok(count as u64)
	}

	/// Lowest and highest zoom level present, `None` for an empty store.
	pub fn zoom_range(&self) -> Result<Option<(u8, u8)>> {
		let conn = self.pool.get()?;
		zoom_range(&conn)
	}

	pub fn metadata(&self, name: &str) -> Result<Option<String>> {
		let conn = self.pool.get()?;
		Ok(conn
			.query_row("SELECT value FROM metadata WHERE name = ?1", [name], |row| row.get(0))
			.optional()?)
	}
}

impl std::fmt::Debug for TileStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TileStore")
			.field("key", &self.key)
			.field("path", &self.path)
			.field("layers", &self.params.layers)
			.field("styles", &self.params.styles)
			.finish_non_exhaustive()
	}
}

fn init_schema(conn: &mut Connection, params: &CacheParams, format: &str) -> Result<()> {
	let transaction = conn.transaction()?;
	transaction.execute_batch(SCHEMA)?;
	let name = params.layers.join(",");
	let description = format!(
		"layers: {}; styles: {}",
		params.layers.join(", "),
		params.styles.join(", ")
	);
	let bounds = format!("-180,{},180,{}", -MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
	for (key, value) in [
		("name", name.as_str()),
		("format", format),
		("type", "overlay"),
		("version", "1.1"),
		("description", description.as_str()),
		("bounds", bounds.as_str()),
	] {
		transaction.execute(
			"INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)",
			params![key, value],
		)?;
	}
	transaction.commit()?;
	Ok(())
}

fn zoom_range(conn: &Connection) -> Result<Option<(u8, u8)>> {
	let (min, max): (Option<u8>, Option<u8>) = conn.query_row("SELECT MIN(zoom_level), MAX(zoom_level) FROM map", [], |row| {
		Ok((row.get(0)?, row.get(1)?))
	})?;
	Ok(min.zip(max))
}

fn shave_tiles(conn: &mut Connection, bbox: &BBox) -> Result<u64> {
	let Some((min_zoom, max_zoom)) = zoom_range(conn)? else {
		return Ok(0);
	};
	let geo = bbox.mercator_to_geo();

	let transaction = conn.transaction()?;
	let mut removed = 0u64;
	for zoom in min_zoom..=max_zoom {
		let range = TileBBox::from_geo(zoom, &geo)?;
		let (row_min, row_max) = range.tms_rows();
		log::trace!("shave {range:?}");
		let filter = params![zoom, range.x_min, range.x_max, row_min, row_max];
		transaction.execute(
			"DELETE FROM images WHERE tile_id IN (
				SELECT tile_id FROM map
				WHERE zoom_level = ?1 AND tile_column BETWEEN ?2 AND ?3 AND tile_row BETWEEN ?4 AND ?5
			)",
			filter,
		)?;
		removed += transaction.execute(
			"DELETE FROM map WHERE zoom_level = ?1 AND tile_column BETWEEN ?2 AND ?3 AND tile_row BETWEEN ?4 AND ?5",
			filter,
		)? as u64;
	}
	transaction.commit()?;
	log::debug!("shaved {removed} tiles in {bbox:?}");
	Ok(removed)
}
