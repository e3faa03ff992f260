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

//! The byte-stream bound `MConnection` is generic over: "a TCP socket or
//! equivalent", per the original. Implemented for `TcpStream` for
//! production use and for `UnixStream` so tests can exercise the exact
//! same code path without binding a port.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

/// A reliable, bidirectional, byte-oriented connection that can be cloned
/// (to hand independent reader/writer handles to the two worker threads)
/// and shut down from any clone.
pub trait DuplexStream: Read + Write + Send + 'static {
	fn try_clone_stream(&self) -> std::io::Result<Self>
	where
		Self: Sized;

	fn shutdown_stream(&self) -> std::io::Result<()>;
}

impl DuplexStream for TcpStream {
	fn try_clone_stream(&self) -> std::io::Result<Self> {
		self.try_clone()
	}

	fn shutdown_stream(&self) -> std::io::Result<()> {
		self.shutdown(Shutdown::Both)
	}
}

#[cfg(unix)]
impl DuplexStream for std::os::unix::net::UnixStream {
	fn try_clone_stream(&self) -> std::io::Result<Self> {
		self.try_clone()
	}

	fn shutdown_stream(&self) -> std::io::Result<()> {
		self.shutdown(Shutdown::Both)
	}
}
