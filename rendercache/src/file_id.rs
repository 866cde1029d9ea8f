//! Identity of a file on disk, independent of its path.

use anyhow::{Context, Result};
use std::{fs, io::ErrorKind, path::Path};

/// Device and inode of a file. A file that is deleted and created again at the same path gets
/// a different id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileId {
	dev: u64,
	ino: u64,
}

impl FileId {
	/// The id of the file at `path`, `None` if there is none.
	pub fn of(path: &Path) -> Result<Option<FileId>> {
		match fs::metadata(path) {
			Ok(metadata) => Ok(Some(FileId::from_metadata(&metadata))),
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e).with_context(|| format!("reading metadata of '{}'", path.display())),
		}
	}

	/// Whether `path` still names this file.
	pub fn is_at(&self, path: &Path) -> Result<bool> {
		Ok(FileId::of(path)? == Some(*self))
	}

	#[cfg(unix)]
	fn from_metadata(metadata: &fs::Metadata) -> FileId {
		use std::os::unix::fs::MetadataExt;
		FileId {
			dev: metadata.dev(),
			ino: metadata.ino(),
		}
	}

	// Without inodes only presence is tracked.
	#[cfg(not(unix))]
	fn from_metadata(_metadata: &fs::Metadata) -> FileId {
		FileId { dev: 0, ino: 0 }
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use assert_fs::TempDir;

	#[test]
	fn follows_the_file() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("a.mbtiles");
		assert_eq!(FileId::of(&path).unwrap(), None);

		fs::write(&path, "first").unwrap();
		let id = FileId::of(&path).unwrap().unwrap();
		assert!(id.is_at(&path).unwrap());

		fs::remove_file(&path).unwrap();
		assert!(!id.is_at(&path).unwrap());
	}

	#[cfg(unix)]
	#[test]
	fn replaced_file_is_another_file() {
		let dir = TempDir::new().unwrap();
		let path = dir.path().join("a.mbtiles");
		let moved = dir.path().join("b.mbtiles");
		fs::write(&path, "first").unwrap();
		let id = FileId::of(&path).unwrap().unwrap();

		fs::rename(&path, &moved).unwrap();
		fs::write(&path, "second").unwrap();
		assert!(!id.is_at(&path).unwrap());
		assert!(id.is_at(&moved).unwrap());
	}
}
