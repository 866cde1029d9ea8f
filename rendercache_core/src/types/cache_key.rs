//! Content-derived cache identities.
//!
//! A [`CacheKey`] is the MD5 digest of a canonical record describing a rendering request.
//! It names every file that belongs to a cache, so it is always 32 lower-case hex digits.
//!
//! ```
//! use rendercache_core::CacheKey;
//!
//! let layers = vec!["roads".to_string()];
//! let styles = vec!["default".to_string()];
//! let a = CacheKey::derive(&layers, "EPSG:3857", &styles, None, true, [("lang", "de"), ("dpi", "96")]).unwrap();
//! let b = CacheKey::derive(&layers, "EPSG:3857", &styles, None, true, [("dpi", "96"), ("lang", "de")]).unwrap();
//! assert_eq!(a, b);
//! assert_eq!(a.as_str().len(), 32);
//! ```

use crate::CacheError;
use anyhow::{Result, bail};
use md5::{Digest, Md5};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Record keys of the canonical record. Query parameters must not reuse them.
pub const RESERVED_KEYS: [&str; 5] = ["layers", "srs", "styles", "bgcolor", "transparent"];

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
	/// Derives the identity of a rendering request.
	///
	/// The record is fed to the digest as `layers, srs, styles, bgcolor, transparent`
	/// followed by the query parameters sorted by key. Every key and every value is length
	/// prefixed, and lists carry their element count, so no two distinct records produce the
	/// same byte stream. An absent `bgcolor` is an empty list, which differs from
	/// `Some("")`. An empty query is the same as no query.
	///
	/// Fails with [`CacheError::KeyDerivation`] if `layers` is empty, an identifier is empty
	/// or contains control characters, or a query key is duplicated or reserved.
	pub fn derive<K, V>(
		layers: &[String],
		srs: &str,
		styles: &[String],
		bgcolor: Option<&str>,
		transparent: bool,
		query: impl IntoIterator<Item = (K, V)>,
	) -> Result<CacheKey>
	where
		K: AsRef<str>,
		V: AsRef<str>,
	{
		if layers.is_empty() {
			return Err(invalid("at least one layer is required"));
		}
		for layer in layers {
			check_identifier("layer", layer)?;
		}
		for style in styles {
			check_identifier("style", style)?;
		}
		check_identifier("srs", srs)?;
		if let Some(color) = bgcolor {
			check_text("bgcolor", color)?;
		}

		let mut params = BTreeMap::new();
		for (key, value) in query {
			let (key, value) = (key.as_ref(), value.as_ref());
			check_identifier("query key", key)?;
			check_text("query value", value)?;
			if RESERVED_KEYS.contains(&key) {
				return Err(invalid(&format!("query key '{key}' is reserved")));
			}
			if params.insert(key.to_string(), value.to_string()).is_some() {
				return Err(invalid(&format!("query key '{key}' is given twice")));
			}
		}

		let mut record = RecordHasher::default();
		record.list("layers", layers.iter().map(String::as_str));
		record.list("srs", [srs]);
		record.list("styles", styles.iter().map(String::as_str));
		record.list("bgcolor", bgcolor);
		record.list("transparent", [if transparent { "true" } else { "false" }]);
		for (key, value) in &params {
			record.list(key, [value.as_str()]);
		}
		Ok(record.finish())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}

	#[must_use]
	pub fn into_string(self) -> String {
		self.0
	}
}

#[derive(Default)]
struct RecordHasher(Md5);

impl RecordHasher {
	fn bytes(&mut self, data: &[u8]) {
		self.0.update((data.len() as u64).to_le_bytes());
		self.0.update(data);
	}

	fn list<'a>(&mut self, key: &str, values: impl IntoIterator<Item = &'a str>) {
		self.bytes(key.as_bytes());
		let values: Vec<&str> = values.into_iter().collect();
		self.0.update((values.len() as u64).to_le_bytes());
		for value in values {
			self.bytes(value.as_bytes());
		}
	}

	fn finish(self) -> CacheKey {
		CacheKey(format!("{:x}", self.0.finalize()))
	}
}

fn invalid(message: &str) -> anyhow::Error {
	CacheError::KeyDerivation(message.to_string()).into()
}

fn check_text(what: &str, value: &str) -> Result<()> {
	if value.chars().any(char::is_control) {
		return Err(invalid(&format!("{what} {value:?} contains control characters")));
	}
	Ok(())
}

fn check_identifier(what: &str, value: &str) -> Result<()> {
	if value.is_empty() {
		return Err(invalid(&format!("{what} must not be empty")));
	}
	check_text(what, value)
}

impl FromStr for CacheKey {
	type Err = anyhow::Error;

	/// Accepts an existing identity, e.g. a name read back from the cache directory.
	fn from_str(s: &str) -> Result<Self> {
		if s.len() != 32 || !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
			bail!("'{s}' is not a cache identity");
		}
		Ok(CacheKey(s.to_string()))
	}
}

impl AsRef<str> for CacheKey {
	fn as_ref(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl fmt::Debug for CacheKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "CacheKey({})", self.0)
	}
}
