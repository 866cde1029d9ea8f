use anyhow::{Context, Result};
use rendercache_core::CacheKey;
use std::collections::BTreeMap;

/// The cacheable parameters of a rendering request.
///
/// Layer and style identifiers are plain slugs. Whatever the caller uses to name them is
/// converted once, on construction.
///
/// ```
/// use rendercache::CacheParams;
///
/// let params = CacheParams::new(["roads"], ["default"])
/// 	.srs("EPSG:3857")
/// 	.query("lang", "de");
/// assert_eq!(params.key().unwrap().as_str().len(), 32);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheParams {
	pub layers: Vec<String>,
	pub styles: Vec<String>,
	pub srs: String,
	pub bgcolor: Option<String>,
	pub transparent: bool,
	pub query: BTreeMap<String, String>,
}

impl CacheParams {
	/// Transparent, Web Mercator, without background color or query.
	pub fn new<L, S>(layers: impl IntoIterator<Item = L>, styles: impl IntoIterator<Item = S>) -> Self
	where
		L: Into<String>,
		S: Into<String>,
	{
		CacheParams {
			layers: layers.into_iter().map(Into::into).collect(),
			styles: styles.into_iter().map(Into::into).collect(),
			srs: String::from("EPSG:3857"),
			bgcolor: None,
			transparent: true,
			query: BTreeMap::new(),
		}
	}

	pub fn srs(mut self, srs: impl Into<String>) -> Self {
		self.srs = srs.into();
		self
	}

	pub fn bgcolor(mut self, color: impl Into<String>) -> Self {
		self.bgcolor = Some(color.into());
		self
	}

	pub fn transparent(mut self, transparent: bool) -> Self {
		self.transparent = transparent;
		self
	}

	pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.query.insert(key.into(), value.into());
		self
	}

	/// The cache identity of these parameters.
	pub fn key(&self) -> Result<CacheKey> {
		CacheKey::derive(
			&self.layers,
			&self.srs,
			&self.styles,
			self.bgcolor.as_deref(),
			self.transparent,
			&self.query,
		)
		.with_context(|| format!("deriving cache key for layers {:?}", self.layers))
	}
}
