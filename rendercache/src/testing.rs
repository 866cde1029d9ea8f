//! Helpers for testing code that uses the cache.

use crate::{RenderRequest, Renderer};
use anyhow::{Result, bail};
use async_trait::async_trait;
use rendercache_core::Blob;
use std::{
	sync::{
		Mutex,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// A [`Renderer`] that counts its invocations and returns a fixed-size PNG-like blob.
#[derive(Debug)]
pub struct MockRenderer {
	calls: AtomicUsize,
	in_flight: AtomicUsize,
	max_in_flight: AtomicUsize,
	requests: Mutex<Vec<RenderRequest>>,
	output_len: usize,
	delay: Duration,
	fail: bool,
}

impl MockRenderer {
	/// Renders 1024 bytes per call, well above the blank threshold.
	pub fn new() -> Self {
		MockRenderer {
			calls: AtomicUsize::new(0),
			in_flight: AtomicUsize::new(0),
			max_in_flight: AtomicUsize::new(0),
			requests: Mutex::new(Vec::new()),
			output_len: 1024,
			delay: Duration::ZERO,
			fail: false,
		}
	}

	/// Sets the size of the rendered blob. Zero yields an empty blob.
	pub fn with_output_len(mut self, len: usize) -> Self {
		self.output_len = len;
		self
	}

	/// Sleeps before answering, to widen race windows in concurrency tests.
	pub fn with_delay(mut self, delay: Duration) -> Self {
		self.delay = delay;
		self
	}

	pub fn failing(mut self) -> Self {
		self.fail = true;
		self
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	/// Highest number of renders that ran at the same time.
	pub fn max_in_flight(&self) -> usize {
		self.max_in_flight.load(Ordering::SeqCst)
	}

	pub fn requests(&self) -> Vec<RenderRequest> {
		self.requests.lock().map(|r| r.clone()).unwrap_or_default()
	}

	/// The blob every successful call returns.
	pub fn expected_output(&self) -> Blob {
		let mut data: Vec<u8> = PNG_SIGNATURE.iter().copied().take(self.output_len).collect();
		data.extend((data.len()..self.output_len).map(|i| (i % 251) as u8));
		Blob::from(data)
	}
}

impl Default for MockRenderer {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Renderer for MockRenderer {
	async fn render(&self, request: &RenderRequest) -> Result<Blob> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if let Ok(mut requests) = self.requests.lock() {
			requests.push(request.clone());
		}
		let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
		self.max_in_flight.fetch_max(running, Ordering::SeqCst);
		if !self.delay.is_zero() {
			tokio::time::sleep(self.delay).await;
		}
		self.in_flight.fetch_sub(1, Ordering::SeqCst);
		if self.fail {
			bail!("mock renderer refused {}x{} {}", request.width, request.height, request.format);
		}
		Ok(self.expected_output())
	}
}
