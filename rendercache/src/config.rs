//! Configuration of a [`CacheManager`](crate::CacheManager).
//!
//! All fields are optional in YAML. Unknown keys are rejected.
//!
//! ```yaml
//! cache_dir: /var/cache/rendercache
//! renderer: mapnik
//! blank_threshold: 350
//! lock_timeout_ms: 30000
//! seed_concurrency: 8
//! ```
//!
//! The environment variable `RENDERCACHE_DIR` replaces `cache_dir` when set.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
	fs::File,
	io::{BufReader, Read},
	path::{Path, PathBuf},
	time::Duration,
};

/// Name of the environment variable overriding [`CacheConfig::cache_dir`].
pub const CACHE_DIR_ENV: &str = "RENDERCACHE_DIR";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
	/// Directory holding `directory.sqlite` and all cache files.
	pub cache_dir: PathBuf,

	/// Kind tag of the renderer to look up in the [`RendererRegistry`](crate::RendererRegistry).
	pub renderer: Option<String>,

	/// Rendered tiles with at most this many bytes are returned but never stored.
	pub blank_threshold: usize,

	/// Edge length of rendered tiles in pixels.
	pub tile_size: u32,

	/// Image format requested for tiles.
	pub tile_format: String,

	/// First polling interval while waiting for a render lock. Doubles up to 16 times this value.
	pub lock_poll_ms: u64,

	/// Give up waiting for a render lock after this long.
	pub lock_timeout_ms: u64,

	/// Lock markers older than this are considered abandoned and removed.
	pub lock_stale_ms: u64,

	/// Number of tiles fetched in parallel while seeding. Stored tiles are read in parallel;
	/// renders of one store still run one at a time under its render lock.
	pub seed_concurrency: usize,

	/// Maximum number of SQLite connections per store.
	pub pool_size: u32,

	/// SQLite busy timeout.
	pub busy_timeout_ms: u64,
}

impl Default for CacheConfig {
	fn default() -> Self {
		CacheConfig {
			cache_dir: std::env::temp_dir().join("rendercache"),
			renderer: None,
			blank_threshold: 350,
			tile_size: 256,
			tile_format: String::from("png"),
			lock_poll_ms: 50,
			lock_timeout_ms: 60_000,
			lock_stale_ms: 600_000,
			seed_concurrency: 4,
			pool_size: 8,
			busy_timeout_ms: 5_000,
		}
	}
}

impl CacheConfig {
	pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
		Ok(serde_yaml_ng::from_reader(reader)?)
	}

	pub fn from_string(text: &str) -> Result<Self> {
		Ok(serde_yaml_ng::from_str(text)?)
	}

	/// Parses a YAML file. A relative `cache_dir` is resolved against the file's directory.
	pub fn from_path(path: &Path) -> Result<Self> {
		let file = File::open(path).with_context(|| format!("opening config '{}'", path.display()))?;
		let mut config =
			CacheConfig::from_reader(BufReader::new(file)).with_context(|| format!("parsing config '{}'", path.display()))?;
		if config.cache_dir.is_relative()
			&& let Some(base) = path.parent()
		{
			config.cache_dir = base.join(&config.cache_dir);
		}
		Ok(config)
	}

	/// Applies `RENDERCACHE_DIR` if it is set and not empty.
	#[must_use]
	pub fn with_env_overrides(mut self) -> Self {
		if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
			self.cache_dir = PathBuf::from(dir);
		}
		self
	}

	pub fn lock_poll(&self) -> Duration {
		Duration::from_millis(self.lock_poll_ms.max(1))
	}

	pub fn lock_timeout(&self) -> Duration {
		Duration::from_millis(self.lock_timeout_ms)
	}

	pub fn lock_stale(&self) -> Duration {
		Duration::from_millis(self.lock_stale_ms)
	}

	pub fn busy_timeout(&self) -> Duration {
		Duration::from_millis(self.busy_timeout_ms)
	}
}
