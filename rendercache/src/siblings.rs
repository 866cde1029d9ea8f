//! Files that belong to a cache. All of them are named `<identity>.<extension>`.

use crate::sqlite;
use anyhow::{Context, Result};
use rendercache_core::CacheKey;
use std::{
	fs,
	io::ErrorKind,
	path::{Path, PathBuf},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SiblingKind {
	TileStore,
	ResultStore,
	/// Compiled renderer style.
	CompiledStyle,
	/// Intermediate layer configuration handed to the style compiler.
	LayerConfig,
	Carto,
	Json,
	/// Result cache of older releases.
	LegacyResults,
	Lock,
}

impl SiblingKind {
	pub const ALL: [SiblingKind; 8] = [
		SiblingKind::TileStore,
		SiblingKind::ResultStore,
		SiblingKind::CompiledStyle,
		SiblingKind::LayerConfig,
		SiblingKind::Carto,
		SiblingKind::Json,
		SiblingKind::LegacyResults,
		SiblingKind::Lock,
	];

	pub fn extension(self) -> &'static str {
		match self {
			SiblingKind::TileStore => "mbtiles",
			SiblingKind::ResultStore => "wmscache",
			SiblingKind::CompiledStyle => "xml",
			SiblingKind::LayerConfig => "mml",
			SiblingKind::Carto => "carto",
			SiblingKind::Json => "json",
			SiblingKind::LegacyResults => "wmsresults",
			SiblingKind::Lock => "lock",
		}
	}

	fn is_database(self) -> bool {
		matches!(
			self,
			SiblingKind::TileStore | SiblingKind::ResultStore | SiblingKind::LegacyResults
		)
	}

	pub fn path(self, dir: &Path, key: &CacheKey) -> PathBuf {
		dir.join(format!("{key}.{}", self.extension()))
	}
}

/// Deletes every sibling file of a cache, including SQLite journals.
/// Returns the number of deleted files.
pub fn remove_siblings(dir: &Path, key: &CacheKey) -> Result<usize> {
	let mut removed = 0;
	for kind in SiblingKind::ALL {
		let path = kind.path(dir, key);
		if kind.is_database() {
			removed += sqlite::remove_database(&path)?;
			continue;
		}
		match fs::remove_file(&path) {
			Ok(()) => removed += 1,
			Err(e) if e.kind() == ErrorKind::NotFound => {}
			Err(e) => return Err(e).with_context(|| format!("removing '{}'", path.display())),
		}
	}
	log::debug!("removed {removed} files of cache {key}");
	Ok(removed)
}
