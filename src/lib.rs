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

//! Multiplex connection: turns one reliable duplex byte stream into several
//! independently-prioritized logical channels.
//!
//! [`conn::MConnection`] is the entry point: build one with
//! [`conn::MConnection::new`], wrap it in an `Arc`, call `start()`, then
//! push bytes through [`conn::MConnection::send`] and receive them through
//! the `on_receive` upcall given at construction.

pub mod channel;
pub mod config;
pub mod conn;
pub mod error;
pub mod flow;
pub mod packet;
pub mod status;
pub mod stream;
pub mod throttle;

pub use channel::Channel;
pub use config::{ChannelDescriptor, MConnConfig};
pub use conn::MConnection;
pub use error::Error;
pub use flow::{FlowMonitor, FlowStatus};
pub use packet::{Packet, PacketMsg};
pub use status::{ChannelStatus, ConnectionStatus};
pub use stream::DuplexStream;
pub use throttle::ThrottleTimer;
