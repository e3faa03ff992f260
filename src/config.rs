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

//! Configuration structs for `MConnection` and its channels, plus the
//! constants the original hard-codes.

use crate::error::Error;
use std::time::Duration;

pub const DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE: usize = 1024;
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1;
pub const DEFAULT_RECV_BUFFER_CAPACITY: usize = 4096;
/// ~21 MiB, matching the original's `defaultRecvMessageCapacity`.
pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22_020_096;
pub const DEFAULT_SEND_RATE: i64 = 512_000;
pub const DEFAULT_RECV_RATE: i64 = 512_000;
pub const DEFAULT_FLUSH_THROTTLE: Duration = Duration::from_millis(100);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(45);

pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);
pub const NUM_BATCH_PACKET_MSGS: usize = 10;
pub const UPDATE_STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Immutable, per-channel configuration. Zero fields are filled with
/// defaults by [`ChannelDescriptor::fill_defaults`].
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
	pub id: u8,
	pub priority: i32,
	pub send_queue_capacity: usize,
	pub recv_buffer_capacity: usize,
	pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
	/// A descriptor with only id and priority set; the rest default on
	/// [`fill_defaults`](Self::fill_defaults).
	pub fn new(id: u8, priority: i32) -> Self {
		ChannelDescriptor {
			id,
			priority,
			send_queue_capacity: 0,
			recv_buffer_capacity: 0,
			recv_message_capacity: 0,
		}
	}

	pub fn fill_defaults(mut self) -> Self {
		if self.send_queue_capacity == 0 {
			self.send_queue_capacity = DEFAULT_SEND_QUEUE_CAPACITY;
		}
		if self.recv_buffer_capacity == 0 {
			self.recv_buffer_capacity = DEFAULT_RECV_BUFFER_CAPACITY;
		}
		if self.recv_message_capacity == 0 {
			self.recv_message_capacity = DEFAULT_RECV_MESSAGE_CAPACITY;
		}
		self
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.priority <= 0 {
			return Err(Error::InvalidPriority(self.id));
		}
		Ok(())
	}
}

/// Tunables for an `MConnection`. See `SPEC_FULL.md` §6 for the meaning of
/// each field.
#[derive(Debug, Clone)]
pub struct MConnConfig {
	pub send_rate: i64,
	pub recv_rate: i64,
	pub max_packet_msg_payload_size: usize,
	pub flush_throttle: Duration,
	pub ping_interval: Duration,
	pub pong_timeout: Duration,
}

impl Default for MConnConfig {
	fn default() -> Self {
		MConnConfig {
			send_rate: DEFAULT_SEND_RATE,
			recv_rate: DEFAULT_RECV_RATE,
			max_packet_msg_payload_size: DEFAULT_MAX_PACKET_MSG_PAYLOAD_SIZE,
			flush_throttle: DEFAULT_FLUSH_THROTTLE,
			ping_interval: DEFAULT_PING_INTERVAL,
			pong_timeout: DEFAULT_PONG_TIMEOUT,
		}
	}
}

impl MConnConfig {
	pub fn validate(&self) -> Result<(), Error> {
		if self.pong_timeout >= self.ping_interval {
			return Err(Error::InvalidTimeoutConfig {
				pong_timeout: self.pong_timeout,
				ping_interval: self.ping_interval,
			});
		}
		Ok(())
	}
}
