// Copyright 2019 The Grin Developers
// Copyright 2024 The MWC Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Measures throughput on a byte stream and blocks callers so that the
//! long-run average never exceeds a configured rate.

use parking_lot::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Rate is measured over a trailing window of this length; bursts older
/// than the window stop counting against the caller.
const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

struct Inner {
	window_start: Instant,
	window_bytes: u64,
	total_bytes: u64,
	started: Instant,
}

/// Snapshot of a `FlowMonitor`'s lifetime counters, returned by `status()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowStatus {
	pub total_bytes: u64,
	pub avg_rate: f64,
	pub duration: Duration,
}

pub struct FlowMonitor {
	inner: Mutex<Inner>,
}

impl FlowMonitor {
	pub fn new() -> Self {
		let now = Instant::now();
		FlowMonitor {
			inner: Mutex::new(Inner {
				window_start: now,
				window_bytes: 0,
				total_bytes: 0,
				started: now,
			}),
		}
	}

	/// Record that `n` bytes just flowed through the monitored stream.
	pub fn update(&self, n: usize) {
		let mut inner = self.inner.lock();
		inner.window_bytes += n as u64;
		inner.total_bytes += n as u64;
	}

	/// Request an allowance of up to `max_chunk` bytes. If `rate_bytes_per_sec`
	/// is exceeded by what has already flowed in the current window, block
	/// (when `block` is set) for exactly the time needed to bring the window
	/// average back down to `rate_bytes_per_sec`. `rate_bytes_per_sec <= 0`
	/// disables the cap entirely.
	pub fn limit(&self, max_chunk: u32, rate_bytes_per_sec: i64, block: bool) -> u32 {
		if rate_bytes_per_sec <= 0 {
			return max_chunk;
		}
		let rate = rate_bytes_per_sec as f64;
		let wait = {
			let mut inner = self.inner.lock();
			let now = Instant::now();
			if now.duration_since(inner.window_start) >= SAMPLE_WINDOW {
				inner.window_start = now;
				inner.window_bytes = 0;
			}
			let elapsed = now
				.duration_since(inner.window_start)
				.max(Duration::from_millis(1))
				.as_secs_f64();
			let allowed = elapsed * rate;
			if inner.window_bytes as f64 > allowed {
				Duration::from_secs_f64((inner.window_bytes as f64 - allowed) / rate)
			} else {
				Duration::from_secs(0)
			}
		};
		if block && !wait.is_zero() {
			thread::sleep(wait);
		}
		max_chunk
	}

	pub fn status(&self) -> FlowStatus {
		let inner = self.inner.lock();
		let duration = inner.started.elapsed();
		let secs = duration.as_secs_f64();
		let avg_rate = if secs > 0.0 {
			inner.total_bytes as f64 / secs
		} else {
			0.0
		};
		FlowStatus {
			total_bytes: inner.total_bytes,
			avg_rate,
			duration,
		}
	}
}

impl Default for FlowMonitor {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unlimited_rate_never_blocks() {
		let m = FlowMonitor::new();
		let start = Instant::now();
		m.update(10_000_000);
		let granted = m.limit(1024, 0, true);
		assert_eq!(granted, 1024);
		assert!(start.elapsed() < Duration::from_millis(50));
	}

	#[test]
	fn burst_forces_a_wait() {
		let m = FlowMonitor::new();
		// Pretend 5_000 bytes flowed instantly, capped at 10_000 bytes/s:
		// the very next `limit` call should be made to wait roughly
		// 5_000 / 10_000 = 500ms worth of overage.
		m.update(5_000);
		let start = Instant::now();
		m.limit(1024, 10_000, true);
		assert!(start.elapsed() >= Duration::from_millis(300));
		assert!(start.elapsed() < Duration::from_secs(2));
	}

	#[test]
	fn status_reports_totals() {
		let m = FlowMonitor::new();
		m.update(2048);
		let status = m.status();
		assert_eq!(status.total_bytes, 2048);
	}
}
