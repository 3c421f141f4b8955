use bilge::prelude::*;

/// The sentinel opening every packet header; framing resynchronizes on it.
pub const INTRO: u8 = 0x07;

/// Packet header length.
pub const HDR_LEN: usize = 6;

/// Length of the trailing payload checksum.
pub const CKSUM_LEN: usize = 4;

/// One past the largest expressible payload length (12-bit length field).
pub const MAX_PACKSIZE: u16 = 1 << 12;

/// Sequence numbers count modulo 32.
pub const MAX_SEQ: u8 = 32;

/// One past the largest channel number (3-bit field).
pub const MAX_CHAN: u8 = 8;

/// The sequence number following `seq`.
#[inline]
pub fn next_seq(seq: u8) -> u8 {
	(seq + 1) & (MAX_SEQ - 1)
}

/// The number of packets from `b` up to `a` in sequence space.
#[inline]
pub fn seq_diff(a: u8, b: u8) -> u8 {
	(a.wrapping_add(MAX_SEQ).wrapping_sub(b)) & (MAX_SEQ - 1)
}

/// The local and remote header bytes: a sequence number over a channel.
#[bitsize(8)]
#[derive(FromBits, Clone, Copy, DebugBits, PartialEq)]
pub struct SeqChan {
	pub chan: u3,
	pub seq: u5,
}

/// The two contents bytes taken together as a big-endian word.
#[bitsize(16)]
#[derive(FromBits, Clone, Copy, DebugBits, PartialEq)]
pub struct Contents {
	pub len: u12,
	pub caller: bool,
	pub kind: u3,
}

/// Packet types. Unlisted bit patterns are reserved for protocol revisions
/// and ignored on receipt.
#[bitsize(3)]
#[derive(TryFromBits, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Data = 0,
	Sync = 1,
	Ack = 2,
	Nak = 3,
	Spos = 4,
	Close = 5,
}

/// The XOR check over the four variable header bytes.
#[inline]
pub fn check(hdr: &[u8]) -> u8 {
	hdr[1] ^ hdr[2] ^ hdr[3] ^ hdr[4]
}

/// A packet header in unpacked form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
	pub kind: Kind,
	/// Set on every packet sent by the calling side of the connection.
	pub caller: bool,
	pub seq: u8,
	pub local_chan: u8,
	/// The last in-order sequence number seen from the peer.
	pub ack: u8,
	pub remote_chan: u8,
	pub len: u16,
}

impl Header {
	pub fn encode(&self) -> [u8; HDR_LEN] {
		let local = SeqChan::new(u3::new(self.local_chan), u5::new(self.seq));
		let remote = SeqChan::new(u3::new(self.remote_chan), u5::new(self.ack));
		let contents = Contents::new(u12::new(self.len), self.caller, u3::new(self.kind as u8));
		let [c1, c2] = u16::from(contents).to_be_bytes();

		let mut hdr = [INTRO, local.into(), remote.into(), c1, c2, 0];
		hdr[5] = check(&hdr);
		hdr
	}

	/// Unpacks a header whose check byte already passed. Returns `None` for a
	/// reserved packet type.
	pub fn decode(hdr: &[u8; HDR_LEN]) -> Option<Self> {
		let local = SeqChan::from(hdr[1]);
		let remote = SeqChan::from(hdr[2]);
		let contents = Contents::from(u16::from_be_bytes([hdr[3], hdr[4]]));

		let kind = Kind::try_from(contents.kind()).ok()?;

		Some(Self {
			kind,
			caller: contents.caller(),
			seq: local.seq().value(),
			local_chan: local.chan().value(),
			ack: remote.seq().value(),
			remote_chan: remote.chan().value(),
			len: contents.len().value(),
		})
	}
}

/// Rewrites the acknowledgment field of a stored frame in place, keeping the
/// channel bits, and fixes up the check byte.
pub fn refresh_ack(frame: &mut [u8], ack: u8) {
	let remote = SeqChan::from(frame[2]);
	frame[2] = SeqChan::new(remote.chan(), u5::new(ack)).into();
	frame[5] = check(frame);
}

/// The payload length recorded in a stored frame's header.
pub fn stored_len(frame: &[u8]) -> usize {
	Contents::from(u16::from_be_bytes([frame[3], frame[4]])).len().value() as usize
}
