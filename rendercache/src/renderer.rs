//! The rendering collaborator and the registry that constructs it.
//!
//! A [`Renderer`] turns a [`RenderRequest`] into encoded image bytes. The cache never
//! inspects those bytes beyond their length.
//!
//! Renderers are registered under a kind tag in a [`RendererRegistry`] at startup; the
//! `renderer` field of [`CacheConfig`] selects one of them.

use crate::CacheConfig;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rendercache_core::{BBox, Blob};
use std::{
	collections::{BTreeMap, HashMap},
	fmt::Debug,
	sync::Arc,
};

/// Everything a renderer needs to produce one image.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderRequest {
	pub format: String,
	pub width: u32,
	pub height: u32,
	/// Extent in the units of `srs`.
	pub bbox: BBox,
	/// Proj descriptor, see [`normalize_srs`](rendercache_core::normalize_srs).
	pub srs: String,
	pub styles: Vec<String>,
	pub layers: Vec<String>,
	pub bgcolor: Option<String>,
	pub transparent: bool,
	/// Additional renderer parameters, e.g. a query restricting the rendered features.
	pub query: BTreeMap<String, String>,
}

/// Produces encoded images. Must be safe to call concurrently.
#[async_trait]
pub trait Renderer: Debug + Send + Sync {
	async fn render(&self, request: &RenderRequest) -> Result<Blob>;
}

type RendererConstructor = Box<dyn Fn(&CacheConfig) -> Result<Arc<dyn Renderer>> + Send + Sync + 'static>;

/// Maps renderer kind tags to constructors.
///
/// ```
/// use rendercache::{CacheConfig, RendererRegistry, testing::MockRenderer};
/// use std::sync::Arc;
///
/// let mut registry = RendererRegistry::new_empty();
/// registry.register("mock", |_config| Ok(Arc::new(MockRenderer::new())));
///
/// assert!(registry.create("mock", &CacheConfig::default()).is_ok());
/// assert!(registry.create("mapnik", &CacheConfig::default()).is_err());
/// ```
#[derive(Clone, Default)]
pub struct RendererRegistry {
	constructors: HashMap<String, Arc<RendererConstructor>>,
}

impl RendererRegistry {
	pub fn new_empty() -> Self {
		Self::default()
	}

	/// Registers a constructor. A previous registration of the same kind is replaced.
	pub fn register<F>(&mut self, kind: &str, constructor: F)
	where
		F: Fn(&CacheConfig) -> Result<Arc<dyn Renderer>> + Send + Sync + 'static,
	{
		self.constructors.insert(sanitize_kind(kind), Arc::new(Box::new(constructor)));
	}

	pub fn create(&self, kind: &str, config: &CacheConfig) -> Result<Arc<dyn Renderer>> {
		let constructor = self.constructors.get(&sanitize_kind(kind)).ok_or_else(|| {
			anyhow!(
				"renderer '{kind}' is not registered, known renderers: [{}]",
				self.kinds().join(", ")
			)
		})?;
		constructor(config)
	}

	/// Registered kind tags in alphabetical order.
	pub fn kinds(&self) -> Vec<String> {
		let mut kinds: Vec<String> = self.constructors.keys().cloned().collect();
		kinds.sort();
		kinds
	}
}

fn sanitize_kind(kind: &str) -> String {
	kind.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MockRenderer;

	#[test]
	fn kinds_are_case_insensitive() {
		let mut registry = RendererRegistry::new_empty();
		registry.register("Mock", |_| Ok(Arc::new(MockRenderer::new())));
		registry.register("other", |_| Ok(Arc::new(MockRenderer::new())));

		assert_eq!(registry.kinds(), ["mock", "other"]);
		assert!(registry.create(" MOCK ", &CacheConfig::default()).is_ok());
	}

	#[test]
	fn unknown_kind_lists_alternatives() {
		let mut registry = RendererRegistry::new_empty();
		registry.register("mock", |_| Ok(Arc::new(MockRenderer::new())));

		let err = registry.create("mapnik", &CacheConfig::default()).unwrap_err();
		assert_eq!(err.to_string(), "renderer 'mapnik' is not registered, known renderers: [mock]");
	}

	#[test]
	fn constructor_sees_config() {
		let mut registry = RendererRegistry::new_empty();
		registry.register("sized", |config| {
			Ok(Arc::new(MockRenderer::new().with_output_len(config.tile_size as usize)))
		});
		let config = CacheConfig {
			tile_size: 512,
			..CacheConfig::default()
		};
		assert!(registry.create("sized", &config).is_ok());
	}
}
