//! This module provides the [`Blob`] struct, a wrapper around [`Vec<u8>`] holding encoded
//! image bytes as they travel between renderer, stores and callers.
//!
//! # Examples
//!
//! ```rust
//! use rendercache_core::Blob;
//!
//! let blob = Blob::from(vec![137, 80, 78, 71]);
//! assert_eq!(blob.len(), 4);
//! assert_eq!(blob.as_slice(), &[137, 80, 78, 71]);
//! ```

use std::fmt::Debug;

/// Encoded bytes of a rendered tile or image.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Blob(Vec<u8>);

impl Blob {
	/// Creates an empty `Blob`.
	#[must_use]
	pub fn new_empty() -> Blob {
		Blob(Vec::new())
	}

	/// Returns the bytes as a slice.
	#[must_use]
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	/// Consumes the blob and returns the underlying vector.
	#[must_use]
	pub fn into_vec(self) -> Vec<u8> {
		self.0
	}

	/// Returns the length in bytes.
	#[must_use]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	/// Interprets the bytes as UTF-8, replacing invalid sequences.
	#[must_use]
	pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
		String::from_utf8_lossy(&self.0)
	}
}

impl From<Vec<u8>> for Blob {
	fn from(vec: Vec<u8>) -> Self {
		Blob(vec)
	}
}

impl From<&[u8]> for Blob {
	fn from(slice: &[u8]) -> Self {
		Blob(slice.to_vec())
	}
}

impl<const N: usize> From<&[u8; N]> for Blob {
	fn from(array: &[u8; N]) -> Self {
		Blob(array.to_vec())
	}
}

impl From<&str> for Blob {
	fn from(text: &str) -> Self {
		Blob(text.as_bytes().to_vec())
	}
}

impl AsRef<[u8]> for Blob {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl Debug for Blob {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		const PREVIEW: usize = 16;
		let head = &self.0[..self.0.len().min(PREVIEW)];
		let ellipsis = if self.0.len() > PREVIEW { ", …" } else { "" };
		write!(f, "Blob({}: {:?}{ellipsis})", self.0.len(), head)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn conversions() {
		let blob = Blob::from("hello");
		assert_eq!(blob.len(), 5);
		assert_eq!(blob.as_str(), "hello");
		assert_eq!(Blob::from(&[1u8, 2, 3]).into_vec(), vec![1, 2, 3]);
		assert!(Blob::new_empty().is_empty());
	}

	#[test]
	fn debug_is_truncated() {
		assert_eq!(format!("{:?}", Blob::from(&[1u8, 2])), "Blob(2: [1, 2])");
		let long = Blob::from(vec![0u8; 20]);
		assert_eq!(
			format!("{long:?}"),
			"Blob(20: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0], …)"
		);
	}
}
