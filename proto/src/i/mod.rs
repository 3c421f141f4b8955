//! The 'i' protocol: a sliding-window packet transport with selective
//! retransmission, designed to run over any eight-bit-clean byte stream.
//!
//! Each packet is a six-byte header (intro byte, sequence/channel, ack/
//! channel, two contents bytes, XOR check) followed, when the length field is
//! nonzero, by the payload and a 32-bit CRC. Sequence numbers count modulo
//! 32; a window bounds how far a sender may run ahead of the peer's
//! acknowledgments. Startup is a symmetric SYNC exchange in which each side
//! advertises the packet and window sizes it wants to receive.

pub mod packet;

mod params;

#[cfg(test)]
mod tests;

use std::time::Duration;

use collections::Ring;
use crc32fast::Hasher;
use log::{debug, error, info};
use port::Port;
use utils::error::*;

use crate::{Protocol, Sink};
use self::packet::*;
pub use self::params::Params;

/// Receive ring capacity: room for a few maximal frames.
const RECV_BUF_LEN: usize = 16384;

/// Smallest packet size worth running with; the allocation fallback in
/// `start` stops halving here.
const MIN_PACKSIZE: u16 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
	Starting,
	Established,
	Closing,
	Closed,
}

#[derive(Default)]
struct Counters {
	/// Packets sent and resent.
	sent: u64,
	resent: u64,
	/// Payload-bearing packets received; feeds the error-decay credit.
	received: u64,
	/// Frames with a bad check byte or the wrong direction bit.
	bad_hdr: u64,
	/// Sequenced packets outside the receive window.
	bad_order: u64,
	/// Payloads whose CRC did not match.
	bad_cksum: u64,
	/// NAKs received from the peer.
	remote_rejects: u64,
	/// Duplicate packets dropped; informational only.
	dups: u64,
}

/// What ended a `wait_for_packet` call.
#[derive(PartialEq, Eq)]
enum Wait {
	/// The sink reported a completed command or file, or the peer closed.
	Exit,
	/// At least one whole packet was processed. Callers waiting on state
	/// carried by packets (window openings, handshakes) recheck and wait
	/// again.
	Found,
	/// The retry budget ran out.
	Timeout,
}

/// One protocol session. All transport state lives here; independent
/// sessions are independent values.
pub struct Iproto<P> {
	port: P,
	params: Params,
	/// Whether this side placed the call. Stamped into every outgoing packet
	/// so a side never mistakes its own echo for peer traffic.
	caller: bool,
	state: State,

	ring: Ring,

	/// Next sequence number to send.
	send_seq: u8,
	/// Last sequence number delivered in order.
	recv_seq: u8,
	/// Last `recv_seq` the peer has been told about.
	local_ack: u8,
	/// Last sequence number the peer has acknowledged.
	remote_ack: u8,
	/// File offset the outgoing stream is at.
	send_pos: u64,
	/// File offset the incoming stream is at.
	recv_pos: u64,

	/// Peer-advertised (or forced) packet and window sizes.
	remote_packsize: u16,
	remote_winsize: u8,

	/// Per-sequence retransmission slots, allocated once SYNC has told us
	/// how big they need to be. A slot is reusable once its sequence number
	/// has been acknowledged.
	send_bufs: Vec<Vec<u8>>,
	/// Out-of-order arrivals parked until the gap before them closes.
	recv_bufs: [Option<Vec<u8>>; MAX_SEQ as usize],
	/// Whether a NAK has already been sent for each missing sequence.
	naked: [bool; MAX_SEQ as usize],

	/// SYNC packets seen; `start` watches this to detect the handshake.
	syncs: u64,
	counters: Counters,
}

/// Writes a whole frame to the port, crediting any bytes that arrive in the
/// meantime to the receive ring.
fn transmit(port: &mut impl Port, ring: &mut Ring, mut frame: &[u8]) -> Result {
	while !frame.is_empty() {
		let space = ring.space();
		let (sent, received) = port.io(frame, space)?;
		ring.commit(received);
		frame = &frame[sent..];
	}

	Ok(())
}

/// Collects the first `N` payload bytes across a ring wrap.
fn gather<const N: usize>(first: &[u8], second: &[u8]) -> Option<[u8; N]> {
	if first.len() + second.len() < N {
		return None;
	}

	let mut out = [0; N];
	for (i, b) in out.iter_mut().enumerate() {
		*b = if i < first.len() { first[i] } else { second[i - first.len()] };
	}

	Some(out)
}

impl<P: Port> Iproto<P> {
	pub fn new(port: P, caller: bool, params: Params) -> Self {
		Self {
			port,
			params,
			caller,
			state: State::Starting,
			ring: Ring::new(RECV_BUF_LEN),
			send_seq: 1,
			recv_seq: 0,
			local_ack: 0,
			remote_ack: 0,
			send_pos: 0,
			recv_pos: 0,
			remote_packsize: 0,
			remote_winsize: 0,
			send_bufs: Vec::new(),
			recv_bufs: std::array::from_fn(|_| None),
			naked: [false; MAX_SEQ as usize],
			syncs: 0,
			counters: Counters::default(),
		}
	}

	/// Reads from the port into the ring: at least `need` bytes, capped by
	/// the free region, within `timeout` seconds. Returns `(got, asked)`.
	fn refill(&mut self, need: usize, timeout: u32, report: bool) -> Result<(usize, usize)> {
		let space = self.ring.space();
		let asked = need.min(space.len());
		let got = self.port.read(space, asked, Duration::from_secs(timeout.into()), report)?;
		self.ring.commit(got);

		Ok((got, asked))
	}

	fn send_nak(&mut self, seq: u8) -> Result {
		let hdr = Header {
			kind: Kind::Nak,
			caller: self.caller,
			seq,
			local_chan: 0,
			ack: self.recv_seq,
			remote_chan: 0,
			len: 0,
		}
		.encode();
		self.local_ack = self.recv_seq;
		self.naked[seq as usize] = true;

		debug!("sending NAK {seq}");

		transmit(&mut self.port, &mut self.ring, &hdr)
	}

	fn send_ack(&mut self) -> Result {
		let hdr = Header {
			kind: Kind::Ack,
			caller: self.caller,
			seq: 0,
			local_chan: 0,
			ack: self.recv_seq,
			remote_chan: 0,
			len: 0,
		}
		.encode();
		self.local_ack = self.recv_seq;

		transmit(&mut self.port, &mut self.ring, &hdr)
	}

	/// Retransmits the frame stored for `seq`, refreshing its piggy-backed
	/// acknowledgment first.
	fn resend(&mut self, seq: u8) -> Result {
		let frame = &mut self.send_bufs[seq as usize];
		if SeqChan::from(frame[2]).seq().value() != self.recv_seq {
			refresh_ack(frame, self.recv_seq);
			self.local_ack = self.recv_seq;
		}

		self.counters.resent += 1;

		let len = stored_len(&self.send_bufs[seq as usize]);
		let total = HDR_LEN + len + if len > 0 { CKSUM_LEN } else { 0 };

		transmit(&mut self.port, &mut self.ring, &self.send_bufs[seq as usize][..total])
	}

	/// The error budget: recoverable corruption is tolerated, but only up to
	/// a level that successful traffic pays down.
	fn check_errors(&mut self) -> Result {
		if self.params.errors < 0 {
			return Ok(());
		}

		let c = &self.counters;
		let level = (c.bad_order + c.bad_hdr + c.bad_cksum + c.remote_rejects) as i64;
		let credit = if self.params.error_decay > 0 {
			c.received as i64 / self.params.error_decay
		} else {
			0
		};

		if level - credit > self.params.errors {
			error!("Too many 'i' protocol errors");
			self.state = State::Closed;
			return Err(());
		}

		Ok(())
	}

	/// Sizes the 32 retransmission slots for the negotiated packet size,
	/// and resets the receive slots to match.
	fn alloc_send_bufs(&mut self) -> bool {
		let size = HDR_LEN + self.remote_packsize as usize + CKSUM_LEN;

		let mut bufs: Vec<Vec<u8>> = Vec::new();
		if bufs.try_reserve_exact(MAX_SEQ as usize).is_err() {
			return false;
		}

		for _ in 0..MAX_SEQ {
			let mut buf = Vec::new();
			if buf.try_reserve_exact(size).is_err() {
				return false;
			}
			buf.resize(size, 0);
			bufs.push(buf);
		}

		self.send_bufs = bufs;

		for slot in &mut self.recv_bufs {
			*slot = None;
		}
		self.naked = [false; MAX_SEQ as usize];

		true
	}

	/// Sends an SPOS packet repositioning the peer's file cursor. The
	/// caller's prepared data is sitting in the current send slot, and the
	/// SPOS must take the current sequence number, so the two slots trade
	/// places first.
	fn send_spos(&mut self, pos: u64) -> Result {
		let seq = self.send_seq;
		let next = next_seq(seq);

		self.send_bufs.swap(seq as usize, next as usize);

		{
			let frame = &mut self.send_bufs[seq as usize];
			let hdr = Header {
				kind: Kind::Spos,
				caller: self.caller,
				seq,
				local_chan: 0,
				ack: self.recv_seq,
				remote_chan: 0,
				len: 4,
			}
			.encode();
			frame[..HDR_LEN].copy_from_slice(&hdr);
			frame[HDR_LEN..HDR_LEN + 4].copy_from_slice(&(pos as u32).to_be_bytes());

			let mut hasher = Hasher::new();
			hasher.update(&frame[HDR_LEN..HDR_LEN + 4]);
			let crc = hasher.finalize();
			frame[HDR_LEN + 4..HDR_LEN + 4 + CKSUM_LEN].copy_from_slice(&crc.to_be_bytes());
		}
		self.local_ack = self.recv_seq;

		debug!("sending SPOS {pos}");

		transmit(&mut self.port, &mut self.ring, &self.send_bufs[seq as usize][..HDR_LEN + 4 + CKSUM_LEN])?;

		self.send_seq = next;
		self.send_pos = pos;

		Ok(())
	}

	/// Runs the framer over the receive ring until it runs dry or stops at a
	/// partial frame. Returns `(exit, found, need)`: whether a handler asked
	/// to leave the wait loop, whether any whole packet went through, and
	/// how many more bytes the framer wants.
	fn process_data(&mut self, sink: &mut dyn Sink) -> Result<(bool, bool, usize)> {
		let mut exit = false;
		let mut found = false;

		while !self.ring.is_empty() {
			// Resynchronize on the intro byte.
			if self.ring.byte(0) != INTRO {
				let contig = self.ring.contig();
				match contig.iter().position(|&b| b == INTRO) {
					Some(at) => self.ring.skip(at),
					None => {
						let n = contig.len();
						self.ring.skip(n);
						continue;
					}
				}
			}

			if self.ring.len() < HDR_LEN {
				return Ok((exit, found, HDR_LEN - self.ring.len()));
			}

			let mut hdr = [0; HDR_LEN];
			for (i, b) in hdr.iter_mut().enumerate() {
				*b = self.ring.byte(i);
			}

			let contents = Contents::from(u16::from_be_bytes([hdr[3], hdr[4]]));

			// The check byte must hold and the direction bit must name the
			// peer, not us.
			if hdr[5] != check(&hdr) || contents.caller() == self.caller {
				debug!("bad header");
				self.counters.bad_hdr += 1;
				self.check_errors()?;
				self.ring.skip(1);
				continue;
			}

			let size = contents.len().value() as usize;
			let local = SeqChan::from(hdr[1]);
			let remote = SeqChan::from(hdr[2]);
			let kind = Kind::try_from(contents.kind()).ok();

			// Only these types consume sequence numbers.
			let seq = match kind {
				Some(Kind::Data | Kind::Spos | Kind::Close) => Some(local.seq().value()),
				_ => None,
			};

			if let Some(seq) = seq {
				// The receive window is anchored at the last ack we sent.
				if self.params.window > 0 && seq_diff(seq, self.local_ack) >= self.params.window {
					debug!("out of order packet {seq}");
					self.counters.bad_order += 1;
					self.check_errors()?;
					self.ring.skip(1);
					continue;
				}
			}

			let frame_len = if size > 0 { HDR_LEN + size + CKSUM_LEN } else { HDR_LEN };

			if size > 0 {
				if self.ring.len() < frame_len {
					return Ok((exit, found, frame_len - self.ring.len()));
				}

				// Checksum the payload where it lies, in two passes when it
				// wraps the ring.
				let (first, second) = self.ring.slices(HDR_LEN, size);
				let mut hasher = Hasher::new();
				hasher.update(first);
				hasher.update(second);
				let computed = hasher.finalize();

				let mut stored = [0; CKSUM_LEN];
				for (i, b) in stored.iter_mut().enumerate() {
					*b = self.ring.byte(HDR_LEN + size + i);
				}
				let stored = u32::from_be_bytes(stored);

				if computed != stored {
					debug!("bad checksum; data {computed:#010x}, frame {stored:#010x}");
					self.counters.bad_cksum += 1;
					self.check_errors()?;

					if let Some(seq) = seq {
						self.send_nak(seq)?;
					}

					self.ring.skip(1);
					continue;
				}
			}

			// The frame is good. Take its acknowledgment, guardedly: stale
			// or duplicated frames must not drag `remote_ack` backwards.
			let ack = remote.seq().value();
			match seq {
				Some(seq) => {
					if self.params.window > 0
						&& seq != self.send_seq
						&& seq_diff(seq, self.remote_ack) <= self.params.window
						&& seq_diff(self.send_seq, seq) <= self.params.window
					{
						self.remote_ack = ack;
					}
				}
				None => {
					if seq_diff(ack, self.remote_ack) <= seq_diff(self.send_seq, self.remote_ack) {
						self.remote_ack = ack;
					}
				}
			}

			if let Some(seq) = seq {
				if seq != next_seq(self.recv_seq) {
					// Not the packet we need next: drop duplicates, park
					// anything genuinely new, and ask for what's missing.
					if seq == self.recv_seq
						|| (self.params.window > 0 && seq_diff(seq, self.recv_seq) > self.params.window)
						|| self.recv_bufs[seq as usize].is_some()
					{
						debug!("ignoring duplicate packet {seq}");
						self.counters.dups += 1;
					} else {
						debug!("saving unexpected packet {seq}");

						let keep = HDR_LEN + size;
						let (first, second) = self.ring.slices(0, keep);
						let mut saved = Vec::with_capacity(keep);
						saved.extend_from_slice(first);
						saved.extend_from_slice(second);
						self.recv_bufs[seq as usize] = Some(saved);

						// One NAK per missing sequence in the gap.
						let mut gap = next_seq(self.recv_seq);
						while gap != seq {
							if !self.naked[gap as usize] {
								self.send_nak(gap)?;
							}
							gap = next_seq(gap);
						}
					}

					self.ring.skip(frame_len);
					if size > 0 {
						self.counters.received += 1;
					}
					continue;
				}

				self.recv_seq = seq;
			}

			found = true;

			match kind {
				Some(Kind::Data) => {
					debug!("got DATA packet {} size {size}", local.seq().value());

					let pos = self.recv_pos;
					let (first, second) = self.ring.slices(HDR_LEN, size);
					exit |= sink.got_data(first, second, remote.chan().value(), local.chan().value(), pos)?;
					self.recv_pos += size as u64;
				}
				Some(Kind::Sync) => {
					// Payload: packet size high byte, low byte, window size.
					let (first, second) = self.ring.slices(HDR_LEN, size);
					let adv = gather::<3>(first, second).some_or(|| error!("Bad SYNC packet"))?;
					let packsize = u16::from_be_bytes([adv[0], adv[1]]);
					let winsize = adv[2];

					debug!("got SYNC packsize {packsize} winsize {winsize}");

					if self.params.remote_packet_size == 0 {
						self.remote_packsize = packsize.min(MAX_PACKSIZE - 1);

						// A mid-session SYNC cannot grow past the slots
						// sized at startup.
						if let Some(slot) = self.send_bufs.first() {
							let cap = (slot.len() - HDR_LEN - CKSUM_LEN) as u16;
							self.remote_packsize = self.remote_packsize.min(cap);
						}
					}
					if self.params.remote_window == 0 {
						self.remote_winsize = winsize;
					}

					self.syncs += 1;
					exit = true;
				}
				Some(Kind::Ack) => {
					// The ack field was consumed above.
					debug!("got ACK {ack}");
				}
				Some(Kind::Nak) => {
					self.counters.remote_rejects += 1;
					self.check_errors()?;

					let nak = local.seq().value();

					if self.params.window > 0
						&& (nak == self.send_seq
							|| seq_diff(nak, self.remote_ack) > self.params.window
							|| seq_diff(self.send_seq, nak) > self.params.window)
					{
						debug!("ignoring out of order NAK {nak}");
					} else {
						debug!("got NAK {nak}; resending packet");
						self.resend(nak)?;
					}
				}
				Some(Kind::Spos) => {
					let (first, second) = self.ring.slices(HDR_LEN, size);
					let wire = gather::<4>(first, second).some_or(|| error!("Bad SPOS packet"))?;
					self.recv_pos = u32::from_be_bytes(wire) as u64;

					debug!("got SPOS {}", self.recv_pos);
				}
				Some(Kind::Close) => {
					if self.state != State::Closing {
						info!("Remote initiated close");
					} else {
						debug!("got CLOSE packet");
					}
					self.state = State::Closed;
					exit = true;
				}
				None => {
					// Reserved type; tolerated for future revisions.
					debug!("got packet type {}", contents.kind().value());
				}
			}

			if size == 0 {
				self.ring.skip(HDR_LEN);
			} else {
				self.ring.skip(frame_len);
				self.counters.received += 1;
			}

			if seq.is_some() {
				// Earlier arrivals may be waiting right behind this one.
				let mut next = next_seq(self.recv_seq);
				while let Some(saved) = self.recv_bufs[next as usize].take() {
					self.recv_seq = next;
					exit |= self.process_saved(&saved, sink)?;
					next = next_seq(self.recv_seq);
				}
			}

			// Half the window has gone unacknowledged; relieve the sender.
			// Packets we send ack implicitly, so this mostly fires when
			// traffic is one-way.
			if self.remote_winsize > 0 && seq_diff(self.recv_seq, self.local_ack) >= self.remote_winsize / 2 {
				let mut i = self.local_ack;
				loop {
					self.naked[i as usize] = false;
					if i == self.recv_seq {
						break;
					}
					i = next_seq(i);
				}

				debug!("sending ACK {}", self.recv_seq);
				self.send_ack()?;
			}
		}

		Ok((exit, found, HDR_LEN))
	}

	/// Replays a parked out-of-order frame once the gap before it has
	/// closed. Only sequenced types are ever parked.
	fn process_saved(&mut self, frame: &[u8], sink: &mut dyn Sink) -> Result<bool> {
		let local = SeqChan::from(frame[1]);
		let remote = SeqChan::from(frame[2]);
		let contents = Contents::from(u16::from_be_bytes([frame[3], frame[4]]));
		let size = contents.len().value() as usize;
		let payload = &frame[HDR_LEN..HDR_LEN + size];

		match Kind::try_from(contents.kind()) {
			Ok(Kind::Data) => {
				debug!("got DATA packet {} size {size}", local.seq().value());

				let pos = self.recv_pos;
				let done = sink.got_data(payload, &[], remote.chan().value(), local.chan().value(), pos)?;
				self.recv_pos += size as u64;

				Ok(done)
			}
			Ok(Kind::Spos) => {
				let wire = gather::<4>(payload, &[]).some_or(|| error!("Bad SPOS packet"))?;
				self.recv_pos = u32::from_be_bytes(wire) as u64;

				debug!("got SPOS {}", self.recv_pos);

				Ok(false)
			}
			Ok(Kind::Close) => {
				if self.state != State::Closing {
					info!("Remote initiated close");
				}
				self.state = State::Closed;

				Ok(true)
			}
			_ => {
				error!("process_saved: unsequenced packet in receive slot");
				Err(())
			}
		}
	}

	/// Alternates between draining the ring and reading from the port until
	/// a handler reports an exit or the retry budget runs out. Timeouts
	/// push: either the oldest unacknowledged packet is resent, or a NAK
	/// prods the peer for the packet we are missing.
	fn wait_for_packet(&mut self, timeout: u32, retries: u32, sink: &mut dyn Sink) -> Result<Wait> {
		let mut short = 0;
		let mut timeouts = 0;

		loop {
			let (exit, found, need) = self.process_data(sink)?;

			if exit {
				return Ok(Wait::Exit);
			}
			if found {
				return Ok(Wait::Found);
			}

			let (got, asked) = self.refill(need, timeout, true)?;

			if got != 0 {
				if got >= asked {
					short = 0;
				} else {
					// Two under-reads in a row usually mean a corrupted
					// length field has us waiting for bytes that will never
					// arrive; skip a byte so the framer hunts for the next
					// intro instead.
					short += 1;
					if short > 1 {
						self.ring.skip(1);
						short = 0;
					}
				}
			} else {
				timeouts += 1;
				if timeouts > retries {
					if retries > 0 {
						error!("Timed out waiting for packet");
					}
					return Ok(Wait::Timeout);
				}

				if next_seq(self.remote_ack) != self.send_seq {
					let seq = next_seq(self.remote_ack);
					debug!("resending packet {seq}");
					self.resend(seq)?;
				} else {
					self.send_nak(next_seq(self.recv_seq))?;
				}
			}
		}
	}
}

impl<P: Port> Protocol for Iproto<P> {
	/// Startup keeps transmitting a SYNC advertising our requested packet
	/// and window sizes until the peer's SYNC arrives, then sizes the
	/// retransmission slots, halving the packet size while allocation
	/// fails.
	fn start(&mut self, sink: &mut dyn Sink) -> Result {
		// Out-of-range forced sizes mean negotiation.
		if self.params.remote_packet_size >= MAX_PACKSIZE {
			self.params.remote_packet_size = 0;
		}
		if self.params.remote_window >= MAX_SEQ {
			self.params.remote_window = 0;
		}
		self.remote_packsize = self.params.remote_packet_size;
		self.remote_winsize = self.params.remote_window;

		self.state = State::Starting;
		self.send_seq = 1;
		self.recv_seq = 0;
		self.local_ack = 0;
		self.remote_ack = 0;
		self.send_pos = 0;
		self.recv_pos = 0;
		self.counters = Counters::default();

		let mut frame = Header {
			kind: Kind::Sync,
			caller: self.caller,
			seq: 0,
			local_chan: 0,
			ack: 0,
			remote_chan: 0,
			len: 3,
		}
		.encode()
		.to_vec();
		frame.extend_from_slice(&self.params.packet_size.to_be_bytes());
		frame.push(self.params.window);

		let mut hasher = Hasher::new();
		hasher.update(&frame[HDR_LEN..]);
		frame.extend_from_slice(&hasher.finalize().to_be_bytes());

		let syncs = self.syncs;
		let mut tries = 0;

		loop {
			debug!("sending SYNC packsize {} winsize {}", self.params.packet_size, self.params.window);

			transmit(&mut self.port, &mut self.ring, &frame)?;

			match self.wait_for_packet(self.params.sync_timeout, 0, sink)? {
				Wait::Exit | Wait::Found => {
					if self.syncs != syncs {
						break;
					}
				}
				Wait::Timeout => {
					tries += 1;
					if tries > self.params.sync_retries {
						error!("Protocol startup failed");
						return Err(());
					}
				}
			}
		}

		loop {
			if self.alloc_send_bufs() {
				debug!("protocol started");
				self.state = State::Established;
				return Ok(());
			}

			self.remote_packsize >>= 1;

			if self.remote_packsize <= MIN_PACKSIZE {
				error!("Protocol startup failed; insufficient memory for packets");
				return Err(());
			}
		}
	}

	/// Shutdown is informal: by the time it runs, the layer above has
	/// already exchanged hangup messages, so nothing needs confirming.
	fn shutdown(&mut self) -> Result {
		self.state = State::Closing;

		let hdr = Header {
			kind: Kind::Close,
			caller: self.caller,
			seq: self.send_seq,
			local_chan: 0,
			ack: self.recv_seq,
			remote_chan: 0,
			len: 0,
		}
		.encode();
		self.local_ack = self.recv_seq;

		debug!("sending CLOSE");

		transmit(&mut self.port, &mut self.ring, &hdr)?;

		let c = &self.counters;
		info!("Protocol 'i' packets: sent {}, resent {}, received {}", c.sent, c.resent, c.received);
		if c.bad_hdr != 0 || c.bad_cksum != 0 || c.bad_order != 0 || c.remote_rejects != 0 {
			info!(
				"Errors: header {}, checksum {}, order {}, remote rejects {}",
				c.bad_hdr, c.bad_cksum, c.bad_order, c.remote_rejects
			);
		}
		if c.dups != 0 {
			debug!("{} duplicate packets dropped", c.dups);
		}

		self.send_bufs = Vec::new();
		self.params = Params::default();
		self.state = State::Closed;

		Ok(())
	}

	fn send_cmd(&mut self, cmd: &str, local_chan: u8, remote_chan: u8, sink: &mut dyn Sink) -> Result {
		debug!("sending command {cmd:?}");

		let mut rest = cmd.as_bytes();

		loop {
			let cap = self.remote_packsize as usize;

			// The final packet carries the terminating NUL.
			if rest.len() < cap {
				let n = rest.len();
				let space = self.space();
				space[..n].copy_from_slice(rest);
				space[n] = 0;

				return self.send_data(n + 1, local_chan, remote_chan, None, sink);
			}

			self.space()[..cap].copy_from_slice(&rest[..cap]);
			self.send_data(cap, local_chan, remote_chan, None, sink)?;
			rest = &rest[cap..];
		}
	}

	fn space(&mut self) -> &mut [u8] {
		assert!(!self.send_bufs.is_empty(), "packet space requested before startup");

		let cap = self.remote_packsize as usize;
		&mut self.send_bufs[self.send_seq as usize][HDR_LEN..HDR_LEN + cap]
	}

	fn send_data(&mut self, len: usize, local_chan: u8, remote_chan: u8, pos: Option<u64>, sink: &mut dyn Sink) -> Result {
		if local_chan >= MAX_CHAN || remote_chan >= MAX_CHAN || len > self.remote_packsize as usize {
			error!("send_data: impossible packet; len {len}, channels {local_chan}/{remote_chan}");
			return Err(());
		}

		// Moving the file cursor needs an SPOS packet ahead of the data.
		if let Some(pos) = pos {
			if pos != self.send_pos {
				self.send_spos(pos)?;
			}
		}

		let seq = self.send_seq;

		{
			let frame = &mut self.send_bufs[seq as usize];
			let hdr = Header {
				kind: Kind::Data,
				caller: self.caller,
				seq,
				local_chan,
				ack: 0,
				remote_chan,
				len: len as u16,
			}
			.encode();
			frame[..HDR_LEN].copy_from_slice(&hdr);

			if len > 0 {
				let mut hasher = Hasher::new();
				hasher.update(&frame[HDR_LEN..HDR_LEN + len]);
				let crc = hasher.finalize();
				frame[HDR_LEN + len..HDR_LEN + len + CKSUM_LEN].copy_from_slice(&crc.to_be_bytes());
			}
		}

		// Wait for the window to open. Ideally the window is large enough
		// that this never blocks.
		if self.remote_winsize > 0 {
			while seq_diff(self.send_seq, self.remote_ack) > self.remote_winsize {
				debug!("waiting for ACK");

				match self.wait_for_packet(self.params.timeout, self.params.retries, sink)? {
					Wait::Exit | Wait::Found => {}
					Wait::Timeout => return Err(()),
				}
			}
		}

		// Only now is the acknowledgment field current.
		refresh_ack(&mut self.send_bufs[seq as usize], self.recv_seq);
		self.local_ack = self.recv_seq;

		debug!("sending packet {seq} ({len} bytes)");

		self.send_seq = next_seq(self.send_seq);
		self.counters.sent += 1;

		let total = HDR_LEN + len + if len > 0 { CKSUM_LEN } else { 0 };
		transmit(&mut self.port, &mut self.ring, &self.send_bufs[seq as usize][..total])?;

		self.send_pos += len as u64;

		// Handle anything that arrived while we were sending.
		if !self.ring.is_empty() {
			self.process_data(sink)?;
		}

		Ok(())
	}

	fn wait(&mut self, sink: &mut dyn Sink) -> Result {
		match self.wait_for_packet(self.params.timeout, self.params.retries, sink)? {
			Wait::Exit | Wait::Found => Ok(()),
			Wait::Timeout => Err(()),
		}
	}

	fn process(&mut self, sink: &mut dyn Sink) -> Result<bool> {
		let (exit, _, _) = self.process_data(sink)?;
		Ok(exit)
	}
}
