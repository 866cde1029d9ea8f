//! Cross-process render locks.
//!
//! A lock is a marker file `<identity>.lock` next to the store, created with
//! `O_CREAT | O_EXCL`. Whoever creates it may render; everybody else polls with
//! exponential backoff until the marker disappears. Markers older than the configured stale
//! age are left over by crashed processes and are removed.
//!
//! Removing a stale marker takes a second marker `<identity>.lock.steal`, and staleness is
//! checked again while holding it. So of several waiters that judged the same marker stale,
//! only one removes it; the others find the new holder's fresh marker.

use crate::file_id::FileId;
use anyhow::{Context, Result};
use rendercache_core::CacheError;
use std::{
	fs::{self, OpenOptions},
	io::{ErrorKind, Write},
	path::{Path, PathBuf},
	time::{Duration, Instant, SystemTime},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
	pub poll: Duration,
	pub timeout: Duration,
	pub stale: Duration,
}

impl From<&crate::CacheConfig> for LockOptions {
	fn from(config: &crate::CacheConfig) -> Self {
		LockOptions {
			poll: config.lock_poll(),
			timeout: config.lock_timeout(),
			stale: config.lock_stale(),
		}
	}
}

/// A held lock marker. Dropping it removes the marker, unless it was taken over meanwhile.
#[derive(Debug)]
pub struct RenderLock {
	path: PathBuf,
	id: Option<FileId>,
}

impl RenderLock {
	/// Creates the marker if nobody holds it.
	pub fn try_acquire(path: &Path) -> Result<Option<RenderLock>> {
		match OpenOptions::new().write(true).create_new(true).open(path) {
			Ok(mut file) => {
				// Holder pid, for inspection only.
				let _ = writeln!(file, "{}", std::process::id());
				Ok(Some(RenderLock {
					path: path.to_path_buf(),
					id: FileId::of(path)?,
				}))
			}
			Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
			Err(e) => Err(e).with_context(|| format!("creating lock marker '{}'", path.display())),
		}
	}

	/// Waits until the marker can be created.
	///
	/// Fails with [`CacheError::LockTimeout`] once `options.timeout` has passed.
	pub async fn acquire(path: &Path, options: &LockOptions) -> Result<RenderLock> {
		let start = Instant::now();
		let max_delay = options.poll * 16;
		let mut delay = options.poll;

		loop {
			if let Some(lock) = RenderLock::try_acquire(path)? {
				log::trace!("acquired {path:?} after {:?}", start.elapsed());
				return Ok(lock);
			}

			if is_stale(path, options.stale) && remove_stale(path, options.stale)? {
				continue;
			}

			let waited = start.elapsed();
			if waited >= options.timeout {
				return Err(CacheError::LockTimeout {
					path: path.to_path_buf(),
					waited,
				}
				.into());
			}

			tokio::time::sleep(delay.min(options.timeout - waited)).await;
			delay = (delay * 2).min(max_delay);
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for RenderLock {
	fn drop(&mut self) {
		if let Some(id) = self.id
			&& !id.is_at(&self.path).unwrap_or(false)
		{
			log::warn!("lock marker {:?} was taken over, leaving it", self.path);
			return;
		}
		if let Err(e) = fs::remove_file(&self.path)
			&& e.kind() != ErrorKind::NotFound
		{
			log::warn!("failed to release lock marker {:?}: {e}", self.path);
		}
	}
}

/// Removes the marker at `path` if it is still older than `max_age` while the steal marker is
/// held. Returns `true` if the marker is gone, `false` if it is fresh or another waiter is
/// removing it.
fn remove_stale(path: &Path, max_age: Duration) -> Result<bool> {
	let mut steal_path = path.as_os_str().to_owned();
	steal_path.push(".steal");
	let steal_path = PathBuf::from(steal_path);

	let Some(_steal) = RenderLock::try_acquire(&steal_path)? else {
		// left behind by a crash while stealing
		if is_stale(&steal_path, max_age) {
			log::warn!("removing abandoned steal marker {steal_path:?}");
			remove_if_exists(&steal_path)?;
		}
		return Ok(false);
	};

	if !is_stale(path, max_age) {
		return Ok(!path.exists());
	}
	log::warn!("removing stale lock marker {path:?}");
	remove_if_exists(path)?;
	Ok(true)
}

fn remove_if_exists(path: &Path) -> Result<()> {
	match fs::remove_file(path) {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e).with_context(|| format!("removing lock marker '{}'", path.display())),
	}
}

fn is_stale(path: &Path, max_age: Duration) -> bool {
	fs::metadata(path)
		.and_then(|m| m.modified())
		.ok()
		.and_then(|modified| SystemTime::now().duration_since(modified).ok())
		.is_some_and(|age| age > max_age)
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_fs::TempDir;
	use std::sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	};

	fn options(timeout_ms: u64) -> LockOptions {
		LockOptions {
			poll: Duration::from_millis(5),
			timeout: Duration::from_millis(timeout_ms),
			stale: Duration::from_secs(600),
		}
	}

	fn make_old(path: &Path) {
		let file = fs::File::options().write(true).open(path).unwrap();
		file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
	}

	#[test]
	fn marker_lifecycle() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("abc.lock");

		let lock = RenderLock::try_acquire(&path).unwrap().unwrap();
		assert!(path.exists());
		assert_eq!(lock.path(), path);
		assert!(RenderLock::try_acquire(&path).unwrap().is_none());

		drop(lock);
		assert!(!path.exists());
		assert!(RenderLock::try_acquire(&path).unwrap().is_some());
	}

	#[tokio::test]
	async fn times_out() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("abc.lock");
		let _held = RenderLock::try_acquire(&path).unwrap().unwrap();

		let err = RenderLock::acquire(&path, &options(40)).await.unwrap_err();
		match CacheError::classify(&err) {
			Some(CacheError::LockTimeout { path: p, waited }) => {
				assert_eq!(p, &path);
				assert!(*waited >= Duration::from_millis(40));
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn waits_for_release() {
		let dir = TempDir::new().unwrap();
		let path = Arc::new(dir.path().join("abc.lock"));
		let held = RenderLock::try_acquire(&path).unwrap().unwrap();

		let waiter = {
			let path = path.clone();
			tokio::spawn(async move { RenderLock::acquire(&path, &options(5_000)).await.map(|_| ()) })
		};
		tokio::time::sleep(Duration::from_millis(30)).await;
		drop(held);

		waiter.await.unwrap().unwrap();
	}

	#[tokio::test]
	async fn removes_stale_marker() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("abc.lock");
		fs::write(&path, "12345\n").unwrap();

		let opts = LockOptions {
			stale: Duration::ZERO,
			..options(1_000)
		};
		tokio::time::sleep(Duration::from_millis(10)).await;
		let lock = RenderLock::acquire(&path, &opts).await.unwrap();
		assert!(lock.path().exists());
	}

	#[test]
	fn stale_removal_rechecks_the_marker() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("abc.lock");
		let max_age = Duration::from_secs(600);

		fs::write(&path, "1\n").unwrap();
		assert!(!remove_stale(&path, max_age).unwrap());
		assert!(path.exists());

		make_old(&path);
		let steal = RenderLock::try_acquire(&dir.path().join("abc.lock.steal")).unwrap().unwrap();
		assert!(!remove_stale(&path, max_age).unwrap());
		assert!(path.exists());

		drop(steal);
		assert!(remove_stale(&path, max_age).unwrap());
		assert!(!path.exists());
		assert!(!dir.path().join("abc.lock.steal").exists());
	}

	#[test]
	fn taken_over_marker_survives_release() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("abc.lock");
		let lock = RenderLock::try_acquire(&path).unwrap().unwrap();

		fs::remove_file(&path).unwrap();
		let successor = RenderLock::try_acquire(&path).unwrap().unwrap();
		drop(lock);
		assert!(path.exists());

		drop(successor);
		assert!(!path.exists());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn stale_marker_has_one_successor() {
		let dir = TempDir::new().unwrap();
		let path = Arc::new(dir.path().join("abc.lock"));
		fs::write(path.as_ref(), "12345\n").unwrap();
		make_old(&path);

		let holders = Arc::new(AtomicUsize::new(0));
		let most = Arc::new(AtomicUsize::new(0));
		let waiters: Vec<_> = (0..4)
			.map(|_| {
				let (path, holders, most) = (path.clone(), holders.clone(), most.clone());
				tokio::spawn(async move {
					let opts = LockOptions {
						poll: Duration::from_millis(1),
						timeout: Duration::from_secs(10),
						stale: Duration::from_secs(600),
					};
					let _lock = RenderLock::acquire(&path, &opts).await.unwrap();
					let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
					most.fetch_max(now, Ordering::SeqCst);
					tokio::time::sleep(Duration::from_millis(20)).await;
					holders.fetch_sub(1, Ordering::SeqCst);
				})
			})
			.collect();
		for waiter in waiters {
			waiter.await.unwrap();
		}

		assert_eq!(most.load(Ordering::SeqCst), 1);
		assert!(!path.exists());
	}
}
