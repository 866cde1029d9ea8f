//! Error taxonomy of the render cache.
//!
//! Functions in this workspace return [`anyhow::Result`]. Whenever a failure belongs to one of
//! the categories below, a [`CacheError`] is attached to the error chain so callers can
//! classify it with [`CacheError::classify`] (or `err.downcast_ref::<CacheError>()`).

use std::{path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
	/// Invalid input for key derivation. Signals a caller bug.
	#[error("cannot derive cache key: {0}")]
	KeyDerivation(String),

	/// A store file exists but cannot be opened or has an unexpected schema.
	#[error("store '{}' is unavailable: {reason}", path.display())]
	StoreUnavailable { path: PathBuf, reason: String },

	/// The renderer failed or produced unusable output. Nothing was persisted.
	#[error("rendering failed: {0}")]
	RenderFailure(String),

	/// The cache directory references a cache name that has no `caches` row.
	#[error("cache directory is inconsistent: {0}")]
	DirectoryInconsistency(String),

	/// A render lock marker was not released in time.
	#[error("timed out after {waited:?} waiting for lock '{}'", path.display())]
	LockTimeout { path: PathBuf, waited: Duration },
}

impl CacheError {
	/// Finds the [`CacheError`] attached to an error chain, if any.
	pub fn classify(err: &anyhow::Error) -> Option<&CacheError> {
		err.downcast_ref::<CacheError>()
	}

	pub fn store_unavailable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
		CacheError::StoreUnavailable {
			path: path.into(),
			reason: reason.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use anyhow::{Context, anyhow};

	#[test]
	fn classify_through_context() {
		let err = anyhow!("disk full")
			.context(CacheError::RenderFailure("renderer crashed".into()))
			.context("fetching tile 3/1/2");
		match CacheError::classify(&err) {
			Some(CacheError::RenderFailure(msg)) => assert_eq!(msg, "renderer crashed"),
			other => panic!("unexpected classification: {other:?}"),
		}
	}

	#[test]
	fn classify_root_cause() {
		let result: anyhow::Result<()> =
			Err(CacheError::KeyDerivation("empty layer".into())).context("deriving key");
		let err = result.unwrap_err();
		assert!(matches!(CacheError::classify(&err), Some(CacheError::KeyDerivation(_))));
		assert_eq!(format!("{:#}", err), "deriving key: cannot derive cache key: empty layer");
	}

	#[test]
	fn unclassified_errors() {
		assert!(CacheError::classify(&anyhow!("plain")).is_none());
	}

	#[test]
	fn display_messages() {
		let err = CacheError::store_unavailable("/tmp/abc.mbtiles", "file is not a database");
		assert_eq!(
			err.to_string(),
			"store '/tmp/abc.mbtiles' is unavailable: file is not a database"
		);
		let err = CacheError::LockTimeout {
			path: PathBuf::from("/tmp/abc.lock"),
			waited: Duration::from_millis(1500),
		};
		assert_eq!(err.to_string(), "timed out after 1.5s waiting for lock '/tmp/abc.lock'");
	}
}
