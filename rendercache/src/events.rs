//! Observable cache events.
//!
//! Stores and the manager emit an [`Event`] whenever they are about to render, remove or
//! shave a cache. Subscribers are plain closures, called synchronously in subscription
//! order. A panicking subscriber does not affect the others or the emitting operation.

use arc_swap::ArcSwap;
use rendercache_core::{BBox, CacheKey, TileCoord};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Event {
	/// A tile was missing from its store and is being rendered.
	TileRenderRequested {
		cache: CacheKey,
		coord: TileCoord,
		layers: Vec<String>,
		styles: Vec<String>,
	},

	/// A WMS result was missing from its store and is being rendered.
	ResultRenderRequested {
		cache: CacheKey,
		bbox: BBox,
		layers: Vec<String>,
		styles: Vec<String>,
	},

	/// All files and directory rows of a cache were deleted.
	CacheRemoved { cache: CacheKey },

	/// Entries intersecting a bounding box were deleted from a store.
	CacheShaved { cache: CacheKey, removed: u64 },

	Warning { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Cheaply cloneable fan-out of [`Event`]s. Clones share their subscribers.
#[derive(Clone)]
pub struct EventBus {
	listeners: Arc<ArcSwap<Vec<EventListener>>>,
}

impl EventBus {
	pub fn new() -> Self {
		Self {
			listeners: Arc::new(ArcSwap::from_pointee(Vec::new())),
		}
	}

	pub fn subscribe<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(&Event) + Send + Sync + 'static,
	{
		let listener: EventListener = Arc::new(listener);
		let previous = self.listeners.rcu(|old| {
			let mut new = (**old).clone();
			new.push(listener.clone());
			new
		});
		ListenerId(previous.len())
	}

	pub fn emit(&self, event: Event) {
		let listeners = self.listeners.load();
		for listener in listeners.iter() {
			let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
				listener(&event);
			}));
		}
	}

	/// Logs a warning and forwards it to subscribers.
	pub fn warn(&self, message: String) {
		log::warn!("{message}");
		self.emit(Event::Warning { message });
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}
