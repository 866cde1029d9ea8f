//! Shared SQLite plumbing of the stores and the cache directory.

use crate::{CacheConfig, file_id::FileId};
use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::{
	SqliteConnectionManager,
	rusqlite::{Connection, OpenFlags},
};
use rendercache_core::CacheError;
use std::{
	fs,
	io::ErrorKind,
	path::{Path, PathBuf},
	sync::atomic::{AtomicU64, Ordering},
};

pub type SqlitePool = Pool<SqliteConnectionManager>;

/// Opens a connection pool. Every connection uses WAL journaling and the configured busy
/// timeout.
pub fn open_pool(path: &Path, config: &CacheConfig) -> Result<SqlitePool> {
	log::trace!("open pool {path:?}");
	let busy_timeout = config.busy_timeout();
	let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
		conn.busy_timeout(busy_timeout)?;
		conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))
	});
	Pool::builder()
		.max_size(config.pool_size.max(1))
		.min_idle(Some(1))
		.build(manager)
		.with_context(|| format!("opening connection pool for '{}'", path.display()))
}

/// Opens a single connection with the configured busy timeout, for one-off work on stores
/// that are not open.
pub fn open_connection(path: &Path, config: &CacheConfig) -> Result<Connection> {
	let conn = Connection::open(path).with_context(|| format!("opening '{}'", path.display()))?;
	conn.busy_timeout(config.busy_timeout())?;
	Ok(conn)
}

/// Creates a database at `path` unless it already exists.
///
/// The database is built under a temporary name and linked into place, so concurrent
/// openers never see a half-initialized file. Returns `false` if somebody else created the
/// file first.
pub fn create_atomically<F>(path: &Path, init: F) -> Result<bool>
where
	F: FnOnce(&mut Connection) -> Result<()>,
{
	static COUNTER: AtomicU64 = AtomicU64::new(0);

	if path.exists() {
		return Ok(false);
	}
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent).with_context(|| format!("creating directory '{}'", parent.display()))?;
	}

	let mut temp = path.as_os_str().to_owned();
	temp.push(format!(
		".{}-{}.tmp",
		std::process::id(),
		COUNTER.fetch_add(1, Ordering::Relaxed)
	));
	let temp = PathBuf::from(temp);

	let result = (|| -> Result<bool> {
		let mut conn = Connection::open(&temp)?;
		conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
		init(&mut conn)?;
		conn.close().map_err(|(_, e)| e)?;

		match fs::hard_link(&temp, path) {
			Ok(()) => Ok(true),
			Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
			Err(e) => Err(e.into()),
		}
	})();

	for suffix in ["", "-wal", "-shm"] {
		let mut side = temp.as_os_str().to_owned();
		side.push(suffix);
		let _ = fs::remove_file(PathBuf::from(side));
	}

	let created = result.with_context(|| format!("creating database '{}'", path.display()))?;
	log::debug!("created {path:?}: {created}");
	Ok(created)
}

/// Identity of the database file just checked by [`check_schema`].
pub fn file_id(path: &Path) -> Result<FileId> {
	FileId::of(path)?.ok_or_else(|| CacheError::store_unavailable(path, "file vanished while opening").into())
}

/// Checks that an existing database can be opened and contains the named tables and views.
///
/// Any failure is reported as [`CacheError::StoreUnavailable`].
pub fn check_schema(path: &Path, required: &[&str]) -> Result<()> {
	let check = || -> Result<(), String> {
		let conn = Connection::open_with_flags(
			path,
			OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
		)
		.map_err(|e| e.to_string())?;
		let mut stmt = conn
			.prepare("SELECT name FROM sqlite_master WHERE type IN ('table', 'view')")
			.map_err(|e| e.to_string())?;
		let names = stmt
			.query_map([], |row| row.get::<_, String>(0))
			.and_then(|rows| rows.collect::<Result<Vec<String>, _>>())
			.map_err(|e| e.to_string())?;
		let missing: Vec<&str> = required
			.iter()
			.copied()
			.filter(|name| !names.iter().any(|n| n == name))
			.collect();
		if missing.is_empty() {
			Ok(())
		} else {
			Err(format!("missing schema objects: {}", missing.join(", ")))
		}
	};
	check().map_err(|reason| CacheError::store_unavailable(path, reason).into())
}

/// Removes a database file together with its WAL and shared-memory files.
/// Returns the number of deleted files.
pub fn remove_database(path: &Path) -> Result<usize> {
	let mut removed = 0;
	for suffix in ["", "-wal", "-shm", "-journal"] {
		let mut file = path.as_os_str().to_owned();
		file.push(suffix);
		match fs::remove_file(PathBuf::from(file)) {
			Ok(()) => removed += 1,
			Err(e) if e.kind() == ErrorKind::NotFound => {}
			Err(e) => return Err(e).with_context(|| format!("removing '{}{suffix}'", path.display())),
		}
	}
	Ok(removed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_fs::TempDir;

	fn init_table(conn: &mut Connection) -> Result<()> {
		conn.execute_batch("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);")?;
		Ok(())
	}

	#[test]
	fn creates_once() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("nested/test.sqlite");

		assert!(create_atomically(&path, init_table).unwrap());
		assert!(!create_atomically(&path, |_| panic!("must not run")).unwrap());
		check_schema(&path, &["items"]).unwrap();

		let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
			.unwrap()
			.map(|e| e.unwrap().file_name().into_string().unwrap())
			.filter(|n| n.contains(".tmp"))
			.collect();
		assert!(leftovers.is_empty(), "{leftovers:?}");
	}

	#[test]
	fn failed_init_leaves_nothing() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("test.sqlite");
		assert!(create_atomically(&path, |_| anyhow::bail!("no schema")).is_err());
		assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
	}

	#[test]
	fn schema_problems_are_unavailable() {
		let dir = TempDir::new().unwrap();
		let garbage = dir.path().join("garbage.sqlite");
		fs::write(&garbage, b"not a database ".repeat(100)).unwrap();
		let err = check_schema(&garbage, &["items"]).unwrap_err();
		assert!(matches!(CacheError::classify(&err), Some(CacheError::StoreUnavailable { .. })));

		let incomplete = dir.path().join("incomplete.sqlite");
		create_atomically(&incomplete, init_table).unwrap();
		let err = check_schema(&incomplete, &["items", "other"]).unwrap_err();
		assert!(err.to_string().ends_with("missing schema objects: other"), "{err}");

		let missing = dir.path().join("missing.sqlite");
		assert!(check_schema(&missing, &[]).is_err());
	}

	#[test]
	fn connections_wait_for_writers() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("test.sqlite");
		create_atomically(&path, init_table).unwrap();
		let config = CacheConfig {
			busy_timeout_ms: 1_234,
			..CacheConfig::default()
		};

		let conn = open_connection(&path, &config).unwrap();
		let timeout: i64 = conn.query_row("PRAGMA busy_timeout", [], |row| row.get(0)).unwrap();
		assert_eq!(timeout, 1_234);

		let pool = open_pool(&path, &config).unwrap();
		let timeout: i64 = pool.get().unwrap().query_row("PRAGMA busy_timeout", [], |row| row.get(0)).unwrap();
		assert_eq!(timeout, 1_234);
	}

	#[test]
	fn pool_uses_wal() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("test.sqlite");
		create_atomically(&path, init_table).unwrap();

		let pool = open_pool(&path, &CacheConfig::default()).unwrap();
		let conn = pool.get().unwrap();
		let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0)).unwrap();
		assert_eq!(mode, "wal");
		drop(conn);
		drop(pool);

		assert!(remove_database(&path).unwrap() >= 1);
		assert!(!path.exists());
	}
}
