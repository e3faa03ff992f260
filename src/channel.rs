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

//! One logical substream of a multiplex connection: a bounded send queue,
//! an outbound fragment cursor, an inbound reassembly buffer, and the
//! running send-average used by the fairness rule.

use crate::config::{ChannelDescriptor, SEND_TIMEOUT};
use crate::error::Error;
use crate::packet::{Packet, PacketMsg};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

pub struct Channel {
	pub desc: ChannelDescriptor,
	queue_tx: Sender<Vec<u8>>,
	queue_rx: Receiver<Vec<u8>>,
	queue_size: AtomicUsize,
	/// The message currently being fragmented for send. `None` when no
	/// fragment is in progress. Touched only by the sender actor.
	sending: Mutex<Option<Vec<u8>>>,
	/// The in-progress inbound reassembly buffer. Touched only by the
	/// receiver actor.
	recving: Mutex<Vec<u8>>,
	/// Exponential moving average of bytes sent; numerator of the fairness
	/// ratio. Decayed by `update_stats`.
	recently_sent: AtomicI64,
	max_packet_msg_payload_size: usize,
}

impl Channel {
	pub fn new(desc: ChannelDescriptor, max_packet_msg_payload_size: usize) -> Self {
		let desc = desc.fill_defaults();
		let (queue_tx, queue_rx) = bounded(desc.send_queue_capacity);
		let recv_buffer_capacity = desc.recv_buffer_capacity;
		Channel {
			desc,
			queue_tx,
			queue_rx,
			queue_size: AtomicUsize::new(0),
			sending: Mutex::new(None),
			recving: Mutex::new(Vec::with_capacity(recv_buffer_capacity)),
			recently_sent: AtomicI64::new(0),
			max_packet_msg_payload_size,
		}
	}

	pub fn id(&self) -> u8 {
		self.desc.id
	}

	/// Enqueue `bytes`, blocking the caller up to `SEND_TIMEOUT`. Returns
	/// `false` (never an `Error`) if the queue stayed full that long.
	pub fn send_bytes(&self, bytes: Vec<u8>) -> bool {
		match self.queue_tx.send_timeout(bytes, SEND_TIMEOUT) {
			Ok(()) => {
				self.queue_size.fetch_add(1, Ordering::SeqCst);
				true
			}
			Err(_) => false,
		}
	}

	/// Enqueue `bytes`, or fail immediately if the queue is full.
	pub fn try_send_bytes(&self, bytes: Vec<u8>) -> bool {
		match self.queue_tx.try_send(bytes) {
			Ok(()) => {
				self.queue_size.fetch_add(1, Ordering::SeqCst);
				true
			}
			Err(_) => false,
		}
	}

	pub fn queue_size(&self) -> usize {
		self.queue_size.load(Ordering::SeqCst)
	}

	/// Heuristic: may be stale the instant it returns.
	pub fn can_send(&self) -> bool {
		self.queue_size() < self.desc.send_queue_capacity
	}

	/// Sender-actor only. If no fragment is in progress, pulls the next
	/// queued message into `sending`. Returns whether a fragment is now
	/// ready to emit.
	pub fn is_send_pending(&self) -> bool {
		let mut sending = self.sending.lock();
		if sending.is_none() {
			match self.queue_rx.try_recv() {
				Ok(msg) => *sending = Some(msg),
				Err(_) => return false,
			}
		}
		true
	}

	/// Sender-actor only. Call only after `is_send_pending()` returned
	/// `true`. Cuts up to `max_packet_msg_payload_size` bytes off the front
	/// of `sending`.
	fn next_packet_msg(&self) -> PacketMsg {
		let mut sending_guard = self.sending.lock();
		let sending = sending_guard
			.take()
			.expect("next_packet_msg called without a pending fragment");
		let max = self.max_packet_msg_payload_size;
		if sending.len() <= max {
			self.queue_size.fetch_sub(1, Ordering::SeqCst);
			PacketMsg {
				channel_id: self.desc.id,
				eof: 0x01,
				bytes: sending,
			}
		} else {
			let mut remainder = sending;
			let bytes = remainder.drain(..max).collect();
			*sending_guard = Some(remainder);
			PacketMsg {
				channel_id: self.desc.id,
				eof: 0x00,
				bytes,
			}
		}
	}

	/// Encodes `next_packet_msg()` to `w` and folds the bytes written into
	/// `recently_sent`. Returns the number of bytes written.
	pub fn write_packet_msg_to<W: Write>(&self, w: &mut W) -> io::Result<usize> {
		let packet = self.next_packet_msg();
		let n = Packet::Msg(packet).encode_to(w)?;
		self.recently_sent.fetch_add(n as i64, Ordering::SeqCst);
		Ok(n)
	}

	/// Receiver-actor only. Appends `packet.bytes` to the reassembly
	/// buffer. Returns `Some(message)` once EOF is seen, `None` for an
	/// incomplete message, or an error if capacity would be exceeded.
	pub fn recv_packet_msg(&self, packet: PacketMsg) -> Result<Option<Vec<u8>>, Error> {
		let mut recving = self.recving.lock();
		let total = recving.len() + packet.bytes.len();
		if total > self.desc.recv_message_capacity {
			return Err(Error::OversizedMessage {
				channel_id: self.desc.id,
				size: total,
				capacity: self.desc.recv_message_capacity,
			});
		}
		recving.extend_from_slice(&packet.bytes);
		if packet.is_eof() {
			let capacity = self.desc.recv_buffer_capacity;
			let msg = std::mem::replace(&mut *recving, Vec::with_capacity(capacity));
			Ok(Some(msg))
		} else {
			Ok(None)
		}
	}

	/// Exponential decay of `recently_sent`, called roughly every 2s.
	pub fn update_stats(&self) {
		loop {
			let cur = self.recently_sent.load(Ordering::SeqCst);
			let next = (cur as f64 * 0.8) as i64;
			if self
				.recently_sent
				.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				break;
			}
		}
	}

	pub fn recently_sent(&self) -> i64 {
		self.recently_sent.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ChannelDescriptor;

	fn channel(priority: i32, send_queue_capacity: usize) -> Channel {
		let mut desc = ChannelDescriptor::new(0x01, priority);
		desc.send_queue_capacity = send_queue_capacity;
		Channel::new(desc, 4)
	}

	#[test]
	fn fragments_a_message_across_several_packets() {
		let ch = channel(1, 4);
		assert!(ch.try_send_bytes((0u8..10).collect()));
		assert!(ch.is_send_pending());

		let mut frames = Vec::new();
		loop {
			let mut buf = Vec::new();
			ch.write_packet_msg_to(&mut buf).unwrap();
			let (pkt, _) = Packet::decode_from(&mut &buf[..], u32::MAX).unwrap();
			let msg = match pkt {
				Packet::Msg(m) => m,
				_ => panic!("expected a Msg packet"),
			};
			let done = msg.is_eof();
			frames.push(msg);
			if done {
				break;
			}
			assert!(ch.is_send_pending());
		}

		assert_eq!(frames.len(), 3);
		assert_eq!(frames[0].eof, 0);
		assert_eq!(frames[1].eof, 0);
		assert_eq!(frames[2].eof, 1);
		assert_eq!(frames[0].bytes, vec![0, 1, 2, 3]);
		assert_eq!(frames[1].bytes, vec![4, 5, 6, 7]);
		assert_eq!(frames[2].bytes, vec![8, 9]);
		assert_eq!(ch.queue_size(), 0);
	}

	#[test]
	fn reassembles_fragments_in_order() {
		let ch = channel(1, 1);
		assert_eq!(
			ch.recv_packet_msg(PacketMsg {
				channel_id: 1,
				eof: 0,
				bytes: vec![1, 2],
			})
			.unwrap(),
			None
		);
		let full = ch
			.recv_packet_msg(PacketMsg {
				channel_id: 1,
				eof: 1,
				bytes: vec![3, 4],
			})
			.unwrap();
		assert_eq!(full, Some(vec![1, 2, 3, 4]));
	}

	#[test]
	fn rejects_messages_over_capacity() {
		let mut desc = ChannelDescriptor::new(0x01, 1);
		desc.recv_message_capacity = 4;
		let ch = Channel::new(desc, 4);
		let err = ch
			.recv_packet_msg(PacketMsg {
				channel_id: 1,
				eof: 1,
				bytes: vec![0u8; 5],
			})
			.unwrap_err();
		assert!(matches!(err, Error::OversizedMessage { .. }));
	}

	#[test]
	fn send_queue_full_try_send_fails_fast() {
		let ch = channel(1, 1);
		assert!(ch.try_send_bytes(vec![1]));
		assert!(!ch.try_send_bytes(vec![2]));
	}

	#[test]
	fn recently_sent_decays_by_0_8() {
		let ch = channel(1, 1);
		ch.recently_sent.store(1000, Ordering::SeqCst);
		ch.update_stats();
		assert_eq!(ch.recently_sent(), 800);
	}
}
