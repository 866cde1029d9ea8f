use crate::{CacheConfig, EventBus, LockOptions, Renderer};
use std::sync::Arc;

/// What every store needs besides its own file: configuration, the renderer and the
/// event bus. Cheap to clone.
#[derive(Clone)]
pub struct CacheRuntime {
	inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
	config: CacheConfig,
	renderer: Arc<dyn Renderer>,
	events: EventBus,
}

impl CacheRuntime {
	pub fn new(config: CacheConfig, renderer: Arc<dyn Renderer>, events: EventBus) -> Self {
		CacheRuntime {
			inner: Arc::new(RuntimeInner {
				config,
				renderer,
				events,
			}),
		}
	}

	pub fn config(&self) -> &CacheConfig {
		&self.inner.config
	}

	pub fn renderer(&self) -> &Arc<dyn Renderer> {
		&self.inner.renderer
	}

	pub fn events(&self) -> &EventBus {
		&self.inner.events
	}

	pub fn lock_options(&self) -> LockOptions {
		LockOptions::from(&self.inner.config)
	}
}

impl std::fmt::Debug for CacheRuntime {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CacheRuntime")
			.field("config", &self.inner.config)
			.field("renderer", &self.inner.renderer)
			.finish_non_exhaustive()
	}
}
