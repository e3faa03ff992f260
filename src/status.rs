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

//! Observable connection/channel status, returned by `MConnection::status`.

use crate::flow::FlowStatus;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelStatus {
	pub id: u8,
	pub send_queue_capacity: usize,
	pub send_queue_size: usize,
	pub priority: i32,
	pub recently_sent: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
	pub duration: Duration,
	pub send_monitor: FlowStatus,
	pub recv_monitor: FlowStatus,
	pub channels: Vec<ChannelStatus>,
}
