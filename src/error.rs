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

//! Fatal error taxonomy for a multiplex connection.
//!
//! Non-fatal outcomes (unknown channel on `send`, a full send queue, a send
//! timeout) are not represented here: callers see them as a plain `false`,
//! the same way `MConnection::Send` does in the original.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Every way an `MConnection` can die. A value of this type reaches
/// `on_error` at most once per connection lifetime.
#[derive(Debug, Error)]
pub enum Error {
	/// No Pong arrived within `pong_timeout` of the last Ping.
	#[error("no pong received within {0:?} of ping")]
	PongTimeout(Duration),

	/// A `Msg` frame named a channel id this connection never registered.
	#[error("received packet for unknown channel {0:#04x}")]
	UnknownChannel(u8),

	/// Reassembling a message would exceed the channel's `recv_message_capacity`.
	#[error(
		"message on channel {channel_id:#04x} exceeds recv_message_capacity: {size} > {capacity}"
	)]
	OversizedMessage {
		channel_id: u8,
		size: usize,
		capacity: usize,
	},

	/// The codec failed to decode a frame off the wire.
	#[error("frame decode error: {0}")]
	FrameDecode(#[source] io::Error),

	/// The peer declared a frame larger than `max_packet_msg_size`.
	#[error("declared frame size {declared} exceeds max_packet_msg_size {limit}")]
	FrameTooLarge { declared: u32, limit: u32 },

	/// Writing a Ping, Pong, or Msg frame to the stream failed.
	#[error("write failure: {0}")]
	Write(#[source] io::Error),

	/// The sender or receiver actor panicked; the payload is best-effort text.
	#[error("connection worker panicked: {0}")]
	Panic(String),

	/// A `ChannelDescriptor` was constructed with a non-positive priority.
	#[error("channel {0:#04x} has non-positive priority")]
	InvalidPriority(u8),

	/// `pong_timeout` was configured to be >= `ping_interval`.
	#[error(
		"pong_timeout ({pong_timeout:?}) must be less than ping_interval ({ping_interval:?})"
	)]
	InvalidTimeoutConfig {
		pong_timeout: Duration,
		ping_interval: Duration,
	},
}
