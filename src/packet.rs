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

//! Wire framing for the three packet kinds a multiplex connection ever
//! puts on the stream: Ping, Pong, and Msg.
//!
//! Frames are a big-endian `u32` byte length prefix, a one-byte tag, and a
//! tag-specific body. The codec is treated as opaque everywhere else in
//! this crate; this module is the one place that picks a concrete
//! encoding for it.

use crate::error::Error;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

const TAG_PING: u8 = 0;
const TAG_PONG: u8 = 1;
const TAG_MSG: u8 = 2;

/// Padding added on top of the worst-case serialized frame size, to leave
/// room for codec evolution (matches the original's `+ 10`).
const FRAME_PADDING: u32 = 10;

/// A fragment of an application message addressed to one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketMsg {
	pub channel_id: u8,
	/// `0x01` if this is the final fragment of the message, `0x00` otherwise.
	pub eof: u8,
	pub bytes: Vec<u8>,
}

impl PacketMsg {
	pub fn is_eof(&self) -> bool {
		self.eof == 0x01
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
	Ping,
	Pong,
	Msg(PacketMsg),
}

impl Packet {
	/// Encode this packet as one length-prefixed frame, returning the
	/// number of bytes written (including the length prefix).
	pub fn encode_to<W: Write>(&self, w: &mut W) -> io::Result<usize> {
		let mut body = Vec::new();
		match self {
			Packet::Ping => body.push(TAG_PING),
			Packet::Pong => body.push(TAG_PONG),
			Packet::Msg(m) => {
				body.push(TAG_MSG);
				body.push(m.channel_id);
				body.push(m.eof);
				body.extend_from_slice(&m.bytes);
			}
		}
		w.write_u32::<BigEndian>(body.len() as u32)?;
		w.write_all(&body)?;
		Ok(4 + body.len())
	}

	/// Decode exactly one frame from `r`, refusing to read a frame whose
	/// declared total on-wire size (length prefix included) exceeds
	/// `max_packet_msg_size`. Returns the packet and the number of bytes
	/// consumed, including the length prefix.
	pub fn decode_from<R: Read>(
		r: &mut R,
		max_packet_msg_size: u32,
	) -> Result<(Packet, usize), Error> {
		let body_len = r.read_u32::<BigEndian>().map_err(Error::FrameDecode)?;
		let frame_total = body_len.saturating_add(4);
		if frame_total > max_packet_msg_size {
			return Err(Error::FrameTooLarge {
				declared: frame_total,
				limit: max_packet_msg_size,
			});
		}
		if body_len == 0 {
			return Err(Error::FrameDecode(io::Error::new(
				io::ErrorKind::InvalidData,
				"empty frame: missing tag byte",
			)));
		}
		let mut body = vec![0u8; body_len as usize];
		r.read_exact(&mut body).map_err(Error::FrameDecode)?;
		let packet = match body[0] {
			TAG_PING => Packet::Ping,
			TAG_PONG => Packet::Pong,
			TAG_MSG => {
				if body.len() < 3 {
					return Err(Error::FrameDecode(io::Error::new(
						io::ErrorKind::InvalidData,
						"truncated Msg frame",
					)));
				}
				Packet::Msg(PacketMsg {
					channel_id: body[1],
					eof: body[2],
					bytes: body[3..].to_vec(),
				})
			}
			tag => {
				return Err(Error::FrameDecode(io::Error::new(
					io::ErrorKind::InvalidData,
					format!("unknown frame tag {}", tag),
				)))
			}
		};
		Ok((packet, frame_total as usize))
	}
}

/// Computes `max_packet_msg_size` once at construction time: the on-wire
/// size of the worst-case Msg frame (payload at `max_packet_msg_payload_size`,
/// EOF set, channel id 1), plus a small padding for codec evolution.
pub fn compute_max_packet_msg_size(max_packet_msg_payload_size: usize) -> u32 {
	let worst = PacketMsg {
		channel_id: 1,
		eof: 1,
		bytes: vec![0u8; max_packet_msg_payload_size],
	};
	let mut buf = Vec::new();
	Packet::Msg(worst)
		.encode_to(&mut buf)
		.expect("encoding to an in-memory Vec cannot fail");
	buf.len() as u32 + FRAME_PADDING
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_ping_pong_msg() {
		for packet in [
			Packet::Ping,
			Packet::Pong,
			Packet::Msg(PacketMsg {
				channel_id: 7,
				eof: 1,
				bytes: vec![1, 2, 3, 4],
			}),
		] {
			let mut buf = Vec::new();
			let written = packet.encode_to(&mut buf).unwrap();
			assert_eq!(written, buf.len());
			let (decoded, consumed) = Packet::decode_from(&mut &buf[..], u32::MAX).unwrap();
			assert_eq!(decoded, packet);
			assert_eq!(consumed, buf.len());
		}
	}

	#[test]
	fn refuses_oversized_declared_length() {
		let max = compute_max_packet_msg_size(4);
		let huge = PacketMsg {
			channel_id: 1,
			eof: 1,
			bytes: vec![0u8; 10_000],
		};
		let mut buf = Vec::new();
		Packet::Msg(huge).encode_to(&mut buf).unwrap();
		let result = Packet::decode_from(&mut &buf[..], max);
		assert!(matches!(result, Err(Error::FrameTooLarge { .. })));
	}

	#[test]
	fn max_packet_msg_size_fits_worst_case_frame() {
		let max = compute_max_packet_msg_size(4);
		let worst = PacketMsg {
			channel_id: 1,
			eof: 1,
			bytes: vec![0u8; 4],
		};
		let mut buf = Vec::new();
		Packet::Msg(worst).encode_to(&mut buf).unwrap();
		assert!(buf.len() as u32 <= max);
	}
}
