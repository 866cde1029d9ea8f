//! Process-wide index of caches: which caches exist, what they store and which layers and
//! styles they depend on.
//!
//! The index lives in `directory.sqlite` inside the cache directory:
//!
//! - `caches(name, kind, srs)` with one row per cache identity,
//! - `layers(slug, cache_name)` and `styles(slug, cache_name)` linking slugs to caches.

use crate::{CacheConfig, EventBus, sqlite};
use anyhow::{Context, Result, bail};
use r2d2_sqlite::rusqlite::{OptionalExtension, Transaction, params};
use rendercache_core::{CacheError, CacheKey};
use std::{
	fmt::Display,
	path::{Path, PathBuf},
	str::FromStr,
};

pub const DIRECTORY_FILE: &str = "directory.sqlite";

const SCHEMA: &str = "
	CREATE TABLE caches (name TEXT PRIMARY KEY, kind TEXT NOT NULL, srs TEXT NOT NULL);
	CREATE TABLE layers (slug TEXT NOT NULL, cache_name TEXT NOT NULL, UNIQUE (slug, cache_name));
	CREATE TABLE styles (slug TEXT NOT NULL, cache_name TEXT NOT NULL, UNIQUE (slug, cache_name));
	CREATE INDEX layers_cache ON layers (cache_name);
	CREATE INDEX styles_cache ON styles (cache_name);
";

const REQUIRED_OBJECTS: [&str; 3] = ["caches", "layers", "styles"];

/// What a cache stores. A cache identity used for tiles and WMS results alike is `Both`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheKind {
	Tile,
	Result,
	Both,
}

impl CacheKind {
	pub fn as_str(self) -> &'static str {
		match self {
			CacheKind::Tile => "tile",
			CacheKind::Result => "result",
			CacheKind::Both => "both",
		}
	}

	pub fn has_tiles(self) -> bool {
		matches!(self, CacheKind::Tile | CacheKind::Both)
	}

	pub fn has_results(self) -> bool {
		matches!(self, CacheKind::Result | CacheKind::Both)
	}
}

impl Display for CacheKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CacheKind {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self> {
		Ok(match s {
			"tile" => CacheKind::Tile,
			"result" => CacheKind::Result,
			"both" => CacheKind::Both,
			_ => bail!("unknown cache kind '{s}'"),
		})
	}
}

/// A cache found by a slug lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheRef {
	pub key: CacheKey,
	pub kind: CacheKind,
	pub srs: String,
}

/// A cache with all of its dependencies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
	pub key: CacheKey,
	pub kind: CacheKind,
	pub srs: String,
	pub layers: Vec<String>,
	pub styles: Vec<String>,
}

#[derive(Clone, Copy)]
enum SlugTable {
	Layers,
	Styles,
}

impl SlugTable {
	fn name(self) -> &'static str {
		match self {
			SlugTable::Layers => "layers",
			SlugTable::Styles => "styles",
		}
	}
}

pub struct CacheDirectory {
	path: PathBuf,
	pool: sqlite::SqlitePool,
	events: EventBus,
}

impl CacheDirectory {
	/// Opens `directory.sqlite` in `config.cache_dir`, creating it if needed.
	pub fn open(config: &CacheConfig, events: EventBus) -> Result<CacheDirectory> {
		let path = config.cache_dir.join(DIRECTORY_FILE);
		log::debug!("open cache directory {path:?}");
		sqlite::create_atomically(&path, |conn| {
			conn.execute_batch(SCHEMA)?;
			Ok(())
		})?;
		sqlite::check_schema(&path, &REQUIRED_OBJECTS)?;
		let pool = sqlite::open_pool(&path, config)?;
		Ok(CacheDirectory { path, pool, events })
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Records a cache and its dependencies. Repeated calls are no-ops, except that a cache
	/// registered with both kinds becomes [`CacheKind::Both`].
	pub fn register(&self, key: &CacheKey, kind: CacheKind, srs: &str, layers: &[String], styles: &[String]) -> Result<()> {
		let mut conn = self.pool.get()?;
		let transaction = conn.transaction()?;
		transaction.execute(
			"INSERT INTO caches (name, kind, srs) VALUES (?1, ?2, ?3)
			ON CONFLICT (name) DO UPDATE SET kind = CASE WHEN kind = excluded.kind THEN kind ELSE 'both' END",
			params![key.as_str(), kind.as_str(), srs],
		)?;
		for layer in layers {
			transaction.execute(
				"INSERT OR IGNORE INTO layers (slug, cache_name) VALUES (?1, ?2)",
				params![layer, key.as_str()],
			)?;
		}
		for style in styles {
			transaction.execute(
				"INSERT OR IGNORE INTO styles (slug, cache_name) VALUES (?1, ?2)",
				params![style, key.as_str()],
			)?;
		}
		transaction
			.commit()
			.with_context(|| format!("registering cache {key} in '{}'", self.path.display()))
	}

	/// Whether `key` is registered as a cache of `kind`, or of both kinds.
	pub fn is_registered(&self, key: &CacheKey, kind: CacheKind) -> Result<bool> {
		let conn = self.pool.get()?;
		let stored: Option<String> = conn
			.query_row("SELECT kind FROM caches WHERE name = ?1", [key.as_str()], |row| row.get(0))
			.optional()?;
		Ok(match stored {
			Some(stored) => {
				let stored = stored.parse::<CacheKind>()?;
				stored == kind || stored == CacheKind::Both
			}
			None => false,
		})
	}

	pub fn caches_for_layer(&self, layer: &str) -> Result<Vec<CacheRef>> {
		self.caches_for(SlugTable::Layers, layer)
	}

	pub fn caches_for_style(&self, style: &str) -> Result<Vec<CacheRef>> {
		self.caches_for(SlugTable::Styles, style)
	}

	/// Slug rows without a matching cache row are reported, deleted and skipped.
	fn caches_for(&self, table: SlugTable, slug: &str) -> Result<Vec<CacheRef>> {
		let table = table.name();
		let mut conn = self.pool.get()?;
		let rows = {
			let mut stmt = conn.prepare(&format!(
				"SELECT DISTINCT s.cache_name, c.kind, c.srs FROM {table} s
				LEFT JOIN caches c ON c.name = s.cache_name
				WHERE s.slug = ?1 ORDER BY s.cache_name"
			))?;
			stmt.query_map([slug], |row| {
				Ok((
					row.get::<_, String>(0)?,
					row.get::<_, Option<String>>(1)?,
					row.get::<_, Option<String>>(2)?,
				))
			})?
			.collect::<Result<Vec<_>, _>>()?
		};

		let mut caches = Vec::new();
		let mut orphans = Vec::new();
		for (name, kind, srs) in rows {
			let parsed = match (name.parse::<CacheKey>(), kind.map(|k| k.parse::<CacheKind>())) {
				(Ok(key), Some(Ok(kind))) => Some(CacheRef {
					key,
					kind,
					srs: srs.unwrap_or_default(),
				}),
				_ => None,
			};
			match parsed {
				Some(cache) => caches.push(cache),
				None => orphans.push(name),
			}
		}

		if !orphans.is_empty() {
			let transaction = conn.transaction()?;
			for name in &orphans {
				let problem = CacheError::DirectoryInconsistency(format!(
					"{table} row '{slug}' references unknown cache '{name}'"
				));
				self.events.warn(problem.to_string());
				delete_rows(&transaction, name)?;
			}
			transaction.commit()?;
		}

		Ok(caches)
	}

	/// Deletes a cache and all rows referencing it in one transaction.
	/// Returns `false` if the cache was not registered.
	pub fn remove(&self, key: &CacheKey) -> Result<bool> {
		let mut conn = self.pool.get()?;
		let transaction = conn.transaction()?;
		let removed = delete_rows(&transaction, key.as_str())?;
		transaction
			.commit()
			.with_context(|| format!("removing cache {key} from '{}'", self.path.display()))?;
		Ok(removed)
	}

	pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
		Ok(self.entries()?.into_iter().find(|entry| &entry.key == key))
	}

	/// All registered caches, ordered by name.
	pub fn entries(&self) -> Result<Vec<CacheEntry>> {
		let conn = self.pool.get()?;
		let mut stmt = conn.prepare("SELECT name, kind, srs FROM caches ORDER BY name")?;
		let rows = stmt
			.query_map([], |row| {
				Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
			})?
			.collect::<Result<Vec<_>, _>>()?;

		let slugs = |table: SlugTable, name: &str| -> Result<Vec<String>> {
			let mut stmt = conn.prepare_cached(&format!(
				"SELECT slug FROM {} WHERE cache_name = ?1 ORDER BY slug",
				table.name()
			))?;
			let slugs = stmt
				.query_map([name], |row| row.get::<_, String>(0))?
				.collect::<Result<Vec<_>, _>>()?;
			Ok(slugs)
		};

		let mut entries = Vec::with_capacity(rows.len());
		for (name, kind, srs) in rows {
			entries.push(CacheEntry {
				key: name.parse().with_context(|| format!("cache name '{name}'"))?,
				kind: kind.parse()?,
				srs,
				layers: slugs(SlugTable::Layers, &name)?,
				styles: slugs(SlugTable::Styles, &name)?,
			});
		}
		Ok(entries)
	}
}

impl std::fmt::Debug for CacheDirectory {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheDirectory").field("path", &self.path).finish()
	}
}

fn delete_rows(transaction: &Transaction, name: &str) -> Result<bool> {
	transaction.execute("DELETE FROM layers WHERE cache_name = ?1", [name])?;
	transaction.execute("DELETE FROM styles WHERE cache_name = ?1", [name])?;
	let removed = transaction.execute("DELETE FROM caches WHERE name = ?1", [name])?;
	Ok(removed > 0)
}
