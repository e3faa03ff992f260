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

//! A debounced signal: `set()` requests an edge, but at most one edge per
//! `interval` is ever emitted, and bursts of `set()` calls within one
//! interval coalesce into a single edge.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct ThrottleTimer {
	set_tx: Sender<()>,
	/// Fires at most once per `interval` after a `set()`.
	pub ch: Receiver<()>,
	stop_tx: Sender<()>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThrottleTimer {
	pub fn new(name: &str, interval: Duration) -> Self {
		let (set_tx, set_rx) = bounded::<()>(1);
		let (fire_tx, fire_rx) = bounded::<()>(1);
		let (stop_tx, stop_rx) = bounded::<()>(1);

		let handle = thread::Builder::new()
			.name(format!("throttle-{}", name))
			.spawn(move || loop {
				select! {
					recv(stop_rx) -> _ => return,
					recv(set_rx) -> res => {
						if res.is_err() {
							// set_tx dropped: owner gone.
							return;
						}
						thread::sleep(interval);
						// Coalesce any sets that piled up while we slept.
						while set_rx.try_recv().is_ok() {}
						let _ = fire_tx.try_send(());
					}
				}
			})
			.expect("failed to spawn throttle timer thread");

		ThrottleTimer {
			set_tx,
			ch: fire_rx,
			stop_tx,
			handle: Mutex::new(Some(handle)),
		}
	}

	/// Mark that a signal is requested. Non-blocking: a pending request
	/// already queued for this interval absorbs this one.
	pub fn set(&self) {
		let _ = self.set_tx.try_send(());
	}

	/// Cancel. After `stop`, `ch` produces no more edges.
	pub fn stop(&self) {
		let _ = self.stop_tx.try_send(());
		if let Some(handle) = self.handle.lock().take() {
			let _ = handle.join();
		}
	}
}
