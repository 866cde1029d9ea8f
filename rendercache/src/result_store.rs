//! Render-on-miss cache for ad-hoc WMS images.
//!
//! A [`ResultStore`] owns one SQLite file `<identity>.wmscache`. Each row holds one rendered
//! image, keyed by the store's identity, the exact bounding box, the pixel size and the
//! format. An R*Tree over the bounding boxes makes spatial invalidation cheap.
//!
//! `last_use` (nanoseconds since the Unix epoch) is refreshed on every read, so old
//! entries can be evicted with [`ResultStore::evict_unused_since`] or
//! [`ResultStore::evict_least_recently_used`].

use crate::{
	CacheConfig, CacheParams, CacheRuntime, Event, RenderLock, RenderRequest, SiblingKind, file_id::FileId, sqlite,
};
use anyhow::{Context, Result, bail, ensure};
use r2d2_sqlite::rusqlite::{Connection, OptionalExtension, Params, params};
use rendercache_core::{BBox, Blob, CacheError, CacheKey, normalize_srs};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::sync::Mutex;

const SCHEMA: &str = "
	CREATE TABLE tiles (
		id INTEGER PRIMARY KEY,
		hash_key TEXT NOT NULL,
		last_use INTEGER NOT NULL,
		tile_data BLOB NOT NULL,
		bounds TEXT NOT NULL,
		x_min REAL NOT NULL,
		y_min REAL NOT NULL,
		x_max REAL NOT NULL,
		y_max REAL NOT NULL
	);
	CREATE UNIQUE INDEX hash_key_lookup ON tiles (hash_key);
	CREATE INDEX lru ON tiles (last_use);
	CREATE VIRTUAL TABLE tiles_bounds USING rtree(id, x_min, x_max, y_min, y_max);
";

const REQUIRED_OBJECTS: [&str; 2] = ["tiles", "tiles_bounds"];

/// Candidates from the R*Tree, which stores 32-bit floats rounded outwards, refined by the
/// exact bounds.
const INTERSECTS: &str = "id IN (
		SELECT id FROM tiles_bounds WHERE x_min <= ?3 AND x_max >= ?1 AND y_min <= ?4 AND y_max >= ?2
	) AND x_min <= ?3 AND x_max >= ?1 AND y_min <= ?4 AND y_max >= ?2";

pub struct ResultStore {
	key: CacheKey,
	path: PathBuf,
	lock_path: PathBuf,
	params: CacheParams,
	file_id: FileId,
	pool: sqlite::SqlitePool,
	runtime: CacheRuntime,
	render_mutex: Mutex<()>,
}

impl ResultStore {
	/// Opens the store of `params` in the runtime's cache directory, creating it if needed.
	///
	/// Fails with [`CacheError::StoreUnavailable`] if an existing file is unreadable.
	pub fn open(params: &CacheParams, runtime: CacheRuntime) -> Result<ResultStore> {
		let key = params.key()?;
		let path = SiblingKind::ResultStore.path(&runtime.config().cache_dir, &key);
		log::debug!("open result store {path:?}");

		sqlite::create_atomically(&path, |conn| {
			conn.execute_batch(SCHEMA)?;
			Ok(())
		})?;
		sqlite::check_schema(&path, &REQUIRED_OBJECTS)?;
		let file_id = sqlite::file_id(&path)?;
		let pool = sqlite::open_pool(&path, runtime.config()).map_err(|e| {
			let reason = format!("{e:#}");
			e.context(CacheError::store_unavailable(&path, reason))
		})?;

		Ok(ResultStore {
			lock_path: SiblingKind::Lock.path(&runtime.config().cache_dir, &key),
			key,
			path,
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

	/// Like [`TileStore::is_current`](crate::TileStore::is_current).
	pub fn is_current(&self) -> Result<bool> {
		self.file_id.is_at(&self.path)
	}

	/// Row key of one image: `<identity>.<bbox>.<width>x<height>.<format>`.
	pub fn hash_key(&self, format: &str, width: u32, height: u32, bbox: &BBox) -> String {
		format!("{}.{}.{width}x{height}.{format}", self.key, bbox.as_key_part())
	}

	/// The request handed to the renderer on a miss. Layers, styles and reference system are
	/// those of the store.
	pub fn render_request(&self, format: &str, width: u32, height: u32, bbox: &BBox) -> RenderRequest {
		RenderRequest {
			format: format.to_string(),
			width,
			height,
			bbox: *bbox,
			srs: normalize_srs(&self.params.srs),
			styles: self.params.styles.clone(),
			layers: self.params.layers.clone(),
			bgcolor: self.params.bgcolor.clone(),
			transparent: self.params.transparent,
			query: self.params.query.clone(),
		}
	}

	/// Reads an image without rendering and refreshes its `last_use`.
	pub fn get(&self, format: &str, width: u32, height: u32, bbox: &BBox) -> Result<Option<Blob>> {
		let hash_key = self.hash_key(format, width, height, bbox);
		let conn = self.pool.get()?;
		let data: Option<Vec<u8>> = conn
			.query_row("SELECT tile_data FROM tiles WHERE hash_key = ?1", [&hash_key], |row| {
				row.get(0)
			})
			.optional()
			.with_context(|| format!("reading '{hash_key}'"))?;
		if data.is_some() {
			conn.execute(
				"UPDATE tiles SET last_use = ?2 WHERE hash_key = ?1",
				params![hash_key, now_nanos()],
			)?;
		}
		Ok(data.map(Blob::from))
	}

	/// Returns the image for `bbox` (in the units of the store's reference system), rendering
	/// it on a miss.
	pub async fn fetch(&self, format: &str, width: u32, height: u32, bbox: &BBox) -> Result<Blob> {
		ensure!(width > 0 && height > 0, "image size {width}x{height} is empty");
		if let Some(blob) = self.get(format, width, height, bbox)? {
			return Ok(blob);
		}

		let _guard = self.render_mutex.lock().await;
		if let Some(blob) = self.get(format, width, height, bbox)? {
			return Ok(blob);
		}
		let _lock = RenderLock::acquire(&self.lock_path, &self.runtime.lock_options()).await?;
		if let Some(blob) = self.get(format, width, height, bbox)? {
			return Ok(blob);
		}

		log::debug!("render {width}x{height} {format} in {bbox:?} for {}", self.key);
		self.runtime.events().emit(Event::ResultRenderRequested {
			cache: self.key.clone(),
			bbox: *bbox,
			layers: self.params.layers.clone(),
			styles: self.params.styles.clone(),
		});

		let request = self.render_request(format, width, height, bbox);
		let blob = self
			.runtime
			.renderer()
			.render(&request)
			.await
			.map_err(|e| e.context(CacheError::RenderFailure(format!("{bbox:?} of cache {}", self.key))))?;
		if blob.is_empty() {
			bail!(CacheError::RenderFailure(format!(
				"renderer returned no data for {bbox:?} of cache {}",
				self.key
			)));
		}

		self.insert(&self.hash_key(format, width, height, bbox), bbox, &blob)?;
		Ok(blob)
	}

	fn insert(&self, hash_key: &str, bbox: &BBox, blob: &Blob) -> Result<()> {
		let mut conn = self.pool.get()?;
		let transaction = conn.transaction()?;
		transaction.execute(
			"DELETE FROM tiles_bounds WHERE id IN (SELECT id FROM tiles WHERE hash_key = ?1)",
			[hash_key],
		)?;
		transaction.execute("DELETE FROM tiles WHERE hash_key = ?1", [hash_key])?;
		transaction.execute(
			"INSERT INTO tiles (hash_key, last_use, tile_data, bounds, x_min, y_min, x_max, y_max)
			VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
			params![
				hash_key,
				now_nanos(),
				blob.as_slice(),
				bbox.as_wkt_polygon(),
				bbox.x_min,
				bbox.y_min,
				bbox.x_max,
				bbox.y_max
			],
		)?;
		let id = transaction.last_insert_rowid();
		transaction.execute(
			"INSERT INTO tiles_bounds (id, x_min, x_max, y_min, y_max) VALUES (?1, ?2, ?3, ?4, ?5)",
			params![id, bbox.x_min, bbox.x_max, bbox.y_min, bbox.y_max],
		)?;
		transaction
			.commit()
			.with_context(|| format!("storing '{hash_key}' in '{}'", self.path.display()))?;
		Ok(())
	}

	/// Deletes every image whose bounds intersect `bbox`, touching edges included.
	/// Returns the number of deleted images.
	pub fn shave(&self, bbox: &BBox) -> Result<u64> {
		let mut conn = self.pool.get()?;
		let removed = shave_results(&mut conn, bbox).with_context(|| format!("shaving '{}'", self.path.display()))?;
		self.runtime.events().emit(Event::CacheShaved {
			cache: self.key.clone(),
			removed,
		});
		Ok(removed)
	}

	/// [`ResultStore::shave`] for a store that is not open.
	pub fn shave_path(path: &Path, bbox: &BBox, config: &CacheConfig) -> Result<u64> {
		sqlite::check_schema(path, &REQUIRED_OBJECTS)?;
		let mut conn = sqlite::open_connection(path, config)?;
		shave_results(&mut conn, bbox).with_context(|| format!("shaving '{}'", path.display()))
	}

	/// Deletes images that were not read or written since `cutoff`.
	pub fn evict_unused_since(&self, cutoff: OffsetDateTime) -> Result<u64> {
		let mut conn = self.pool.get()?;
		let cutoff = cutoff.unix_timestamp_nanos() as i64;
		delete_matching(&mut conn, "last_use < ?1", [cutoff])
	}

	/// Keeps the `keep` most recently used images and deletes the rest.
	pub fn evict_least_recently_used(&self, keep: usize) -> Result<u64> {
		let mut conn = self.pool.get()?;
		delete_matching(
			&mut conn,
			"id IN (SELECT id FROM tiles ORDER BY last_use DESC, id DESC LIMIT -1 OFFSET ?1)",
			[i64::try_from(keep).unwrap_or(i64::MAX)],
		)
	}

	pub fn len(&self) -> Result<u64> {
		let conn = self.pool.get()?;
		let count: i64 = conn.query_row("SELECT COUNT(*) FROM tiles", [], |row| row.get(0))?;
		Ok(count as u64)
	}

	pub fn is_empty(&self) -> Result<bool> {
		Ok(self.len()? == 0)
	}
}

impl std::fmt::Debug for ResultStore {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ResultStore")
			.field("key", &self.key)
			.field("path", &self.path)
			.finish_non_exhaustive()
	}
}

fn now_nanos() -> i64 {
	OffsetDateTime::now_utc().unix_timestamp_nanos() as i64
}

fn shave_results(conn: &mut Connection, bbox: &BBox) -> Result<u64> {
	let removed = delete_matching(conn, INTERSECTS, params![bbox.x_min, bbox.y_min, bbox.x_max, bbox.y_max])?;
	log::debug!("shaved {removed} results in {bbox:?}");
	Ok(removed)
}

/// Deletes the `tiles` rows matching `condition` and their R*Tree entries in one transaction.
fn delete_matching<P: Params>(conn: &mut Connection, condition: &str, params: P) -> Result<u64> {
	let transaction = conn.transaction()?;
	let ids = {
		let mut stmt = transaction.prepare(&format!("SELECT id FROM tiles WHERE {condition}"))?;
		stmt.query_map(params, |row| row.get::<_, i64>(0))?
			.collect::<Result<Vec<i64>, _>>()?
	};
	for id in &ids {
		transaction.execute("DELETE FROM tiles_bounds WHERE id = ?1", [id])?;
		transaction.execute("DELETE FROM tiles WHERE id = ?1", [id])?;
	}
	transaction.commit()?;
	Ok(ids.len() as u64)
}
