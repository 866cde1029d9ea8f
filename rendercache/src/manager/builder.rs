use super::CacheManager;
use crate::{CacheConfig, CacheRuntime, Event, EventBus, Renderer, RendererRegistry};
use anyhow::{Context, Result, bail};
use std::{fs, path::PathBuf, sync::Arc};

type Listener = Box<dyn Fn(&Event) + Send + Sync>;

/// Assembles a [`CacheManager`].
///
/// The renderer is either passed directly or looked up by the `renderer` kind tag of the
/// configuration in a [`RendererRegistry`].
///
/// ```no_run
/// use rendercache::{CacheConfig, CacheManager, testing::MockRenderer};
/// use std::sync::Arc;
///
/// let config = CacheConfig::from_string("renderer: mock\nseed_concurrency: 8").unwrap();
/// let manager = CacheManager::builder()
/// 	.config(config)
/// 	.customize_registry(|registry| {
/// 		registry.register("mock", |_config| Ok(Arc::new(MockRenderer::new())));
/// 	})
/// 	.subscribe(|event| println!("{event:?}"))
/// 	.build()
/// 	.unwrap();
/// ```
pub struct CacheManagerBuilder {
	config: Option<CacheConfig>,
	cache_dir: Option<PathBuf>,
	renderer: Option<Arc<dyn Renderer>>,
	#[allow(clippy::type_complexity)]
	registry_customizer: Option<Box<dyn FnOnce(&mut RendererRegistry)>>,
	listeners: Vec<Listener>,
}

impl CacheManagerBuilder {
	pub fn new() -> Self {
		Self {
			config: None,
			cache_dir: None,
			renderer: None,
			registry_customizer: None,
			listeners: Vec::new(),
		}
	}

	/// Defaults to [`CacheConfig::default`]. `RENDERCACHE_DIR` is applied on top.
	pub fn config(mut self, config: CacheConfig) -> Self {
		self.config = Some(config);
		self
	}

	/// Overrides the cache directory of the configuration and of `RENDERCACHE_DIR`.
	pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.cache_dir = Some(dir.into());
		self
	}

	/// Uses this renderer instead of a registry lookup.
	pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
		self.renderer = Some(renderer);
		self
	}

	/// Registers renderer constructors before the configured kind is looked up.
	pub fn customize_registry<F>(mut self, customizer: F) -> Self
	where
		F: FnOnce(&mut RendererRegistry) + 'static,
	{
		self.registry_customizer = Some(Box::new(customizer));
		self
	}

	/// Subscribes to the manager's events from the start.
	pub fn subscribe<F>(mut self, listener: F) -> Self
	where
		F: Fn(&Event) + Send + Sync + 'static,
	{
		self.listeners.push(Box::new(listener));
		self
	}

	/// Creates the cache directory if needed and opens the cache index.
	pub fn build(self) -> Result<CacheManager> {
		let mut config = self.config.unwrap_or_default().with_env_overrides();
		if let Some(dir) = self.cache_dir {
			config.cache_dir = dir;
		}

		let renderer = match (self.renderer, &config.renderer) {
			(Some(renderer), _) => renderer,
			(None, Some(kind)) => {
				let mut registry = RendererRegistry::default();
				if let Some(customizer) = self.registry_customizer {
					customizer(&mut registry);
				}
				registry.create(kind, &config)?
			}
			(None, None) => bail!("no renderer given and none configured"),
		};

		fs::create_dir_all(&config.cache_dir)
			.with_context(|| format!("creating cache directory '{}'", config.cache_dir.display()))?;

		let events = EventBus::new();
		for listener in self.listeners {
			events.subscribe(listener);
		}

		log::debug!("cache manager in {:?} with {renderer:?}", config.cache_dir);
		CacheManager::new(CacheRuntime::new(config, renderer, events))
	}
}

impl Default for CacheManagerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::testing::MockRenderer;
	use assert_fs::TempDir;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn renderer_is_required() {
		let dir = TempDir::new().unwrap();
		let err = CacheManager::builder().cache_dir(dir.path()).build().unwrap_err();
		assert_eq!(err.to_string(), "no renderer given and none configured");
	}

	#[test]
	fn renderer_from_registry() {
		let dir = TempDir::new().unwrap();
		let config = CacheConfig {
			renderer: Some(String::from("mock")),
			..CacheConfig::default()
		};

		let manager = CacheManager::builder()
			.config(config.clone())
			.cache_dir(dir.path())
			.customize_registry(|registry| {
				registry.register("mock", |_| Ok(Arc::new(MockRenderer::new())));
			})
			.build()
			.unwrap();
		assert_eq!(manager.config().cache_dir, dir.path());
		assert!(dir.path().join("directory.sqlite").exists());

		let err = CacheManager::builder()
			.config(config)
			.cache_dir(dir.path())
			.build()
			.unwrap_err();
		assert!(err.to_string().contains("'mock' is not registered"), "{err}");
	}

	#[test]
	fn creates_nested_cache_dir() {
		let dir = TempDir::new().unwrap();
		let nested = dir.path().join("a").join("b");
		CacheManager::builder()
			.cache_dir(&nested)
			.renderer(Arc::new(MockRenderer::new()))
			.build()
			.unwrap();
		assert!(nested.join("directory.sqlite").exists());
	}

	#[tokio::test]
	async fn listeners_see_events() {
		let dir = TempDir::new().unwrap();
		let renders = Arc::new(AtomicUsize::new(0));
		let counter = renders.clone();
		let manager = CacheManager::builder()
			.cache_dir(dir.path())
			.renderer(Arc::new(MockRenderer::new()))
			.subscribe(move |event| {
				if let Event::TileRenderRequested { .. } = event {
					counter.fetch_add(1, Ordering::SeqCst);
				}
			})
			.build()
			.unwrap();

		let store = manager
			.get_tile_store(&crate::CacheParams::new(["roads"], ["default"]))
			.unwrap();
		let coord = rendercache_core::TileCoord::new(0, 0, 0).unwrap();
		store.fetch(&coord).await.unwrap();
		store.fetch(&coord).await.unwrap();
		assert_eq!(renders.load(Ordering::SeqCst), 1);
	}
}
