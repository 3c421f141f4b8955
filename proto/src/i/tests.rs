use std::collections::VecDeque;
use std::time::Duration;

use crc32fast::Hasher;
use port::Port;
use utils::error::Result;

use super::packet::*;
use super::{Iproto, Params, State};
use crate::{Protocol, Sink};

/// A port with scripted input; reads deliver whatever has been queued, and
/// an empty queue reads as a timeout.
struct TestPort {
	inbound: VecDeque<u8>,
	outbound: Vec<u8>,
}

impl TestPort {
	fn new() -> Self {
		Self {
			inbound: VecDeque::new(),
			outbound: Vec::new(),
		}
	}

	fn push(&mut self, bytes: &[u8]) {
		self.inbound.extend(bytes);
	}
}

impl Port for TestPort {
	fn io(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(usize, usize)> {
		self.outbound.extend_from_slice(send);

		let n = recv.len().min(self.inbound.len());
		for b in &mut recv[..n] {
			*b = self.inbound.pop_front().unwrap();
		}

		Ok((send.len(), n))
	}

	fn read(&mut self, recv: &mut [u8], _min: usize, _timeout: Duration, _report: bool) -> Result<usize> {
		let n = recv.len().min(self.inbound.len());
		for b in &mut recv[..n] {
			*b = self.inbound.pop_front().unwrap();
		}

		Ok(n)
	}
}

#[derive(Default)]
struct TestSink {
	/// (payload, local channel, remote channel, file position) per delivery.
	data: Vec<(Vec<u8>, u8, u8, u64)>,
	/// Report a zero-length payload as a completion, like a file receiver.
	exit_on_empty: bool,
}

impl Sink for TestSink {
	fn got_data(&mut self, first: &[u8], second: &[u8], local_chan: u8, remote_chan: u8, pos: u64) -> Result<bool> {
		let mut payload = first.to_vec();
		payload.extend_from_slice(second);

		let done = payload.is_empty() && self.exit_on_empty;
		self.data.push((payload, local_chan, remote_chan, pos));

		Ok(done)
	}
}

fn crc(payload: &[u8]) -> [u8; 4] {
	let mut hasher = Hasher::new();
	hasher.update(payload);
	hasher.finalize().to_be_bytes()
}

/// A frame as the peer (the called side) would send it.
fn frame(kind: Kind, seq: u8, ack: u8, payload: &[u8]) -> Vec<u8> {
	let mut f = Header {
		kind,
		caller: false,
		seq,
		local_chan: 0,
		ack,
		remote_chan: 0,
		len: payload.len() as u16,
	}
	.encode()
	.to_vec();

	if !payload.is_empty() {
		f.extend_from_slice(payload);
		f.extend_from_slice(&crc(payload));
	}

	f
}

fn sync(packsize: u16, winsize: u8) -> Vec<u8> {
	let mut payload = packsize.to_be_bytes().to_vec();
	payload.push(winsize);
	frame(Kind::Sync, 0, 0, &payload)
}

/// Splits captured output back into frames.
fn sent_frames(bytes: &[u8]) -> Vec<(Header, Vec<u8>)> {
	let mut out = Vec::new();
	let mut rest = bytes;

	while !rest.is_empty() {
		let hdr = Header::decode(rest[..HDR_LEN].try_into().unwrap()).unwrap();
		let len = hdr.len as usize;
		let total = HDR_LEN + len + if len > 0 { CKSUM_LEN } else { 0 };

		out.push((hdr, rest[HDR_LEN..HDR_LEN + len].to_vec()));
		rest = &rest[total..];
	}

	out
}

fn naks(bytes: &[u8]) -> Vec<u8> {
	sent_frames(bytes)
		.iter()
		.filter(|(h, _)| h.kind == Kind::Nak)
		.map(|(h, _)| h.seq)
		.collect()
}

/// An engine as the calling side, started against a peer advertising the
/// given sizes.
fn started(packsize: u16, winsize: u8) -> (Iproto<TestPort>, TestSink) {
	let mut port = TestPort::new();
	port.push(&sync(packsize, winsize));

	let mut proto = Iproto::new(port, true, Params::default());
	let mut sink = TestSink::default();
	proto.start(&mut sink).unwrap();

	(proto, sink)
}

/// Moves queued port input into the receive ring without blocking.
fn pump(proto: &mut Iproto<TestPort>) {
	while !proto.port.inbound.is_empty() {
		let before = proto.port.inbound.len();
		proto.refill(before, 0, false).unwrap();

		// Ring full; the caller has to process before pumping more.
		if proto.port.inbound.len() == before {
			break;
		}
	}
}

#[test]
fn sync_negotiation() {
	let (proto, _) = started(512, 8);

	assert_eq!(proto.remote_packsize, 512);
	assert_eq!(proto.remote_winsize, 8);
	assert_eq!(proto.state, State::Established);
	assert_eq!(proto.send_bufs.len(), 32);
	assert_eq!(proto.send_bufs[0].len(), HDR_LEN + 512 + CKSUM_LEN);

	// Our own SYNC advertised the default 1024/16.
	let sent = sent_frames(&proto.port.outbound);
	assert_eq!(sent[0].0.kind, Kind::Sync);
	assert!(sent[0].0.caller);
	assert_eq!(sent[0].1, [4, 0, 16]);
}

#[test]
fn forced_remote_sizes() {
	let mut port = TestPort::new();
	port.push(&sync(512, 8));

	let mut params = Params::default();
	params.set("remote-packet-size", 256).unwrap();
	params.set("remote-window", 4).unwrap();

	let mut proto = Iproto::new(port, true, params);
	proto.start(&mut TestSink::default()).unwrap();

	// The overrides win over the peer's advertisement.
	assert_eq!(proto.remote_packsize, 256);
	assert_eq!(proto.remote_winsize, 4);
}

#[test]
fn startup_gives_up() {
	// No peer SYNC ever arrives; the handshake retries, then fails.
	let mut proto = Iproto::new(TestPort::new(), true, Params::default());
	assert!(proto.start(&mut TestSink::default()).is_err());

	let sent = sent_frames(&proto.port.outbound);
	let syncs = sent.iter().filter(|(h, _)| h.kind == Kind::Sync).count();
	assert_eq!(syncs, 7);
}

#[test]
fn in_order_delivery() {
	let (mut proto, mut sink) = started(1024, 16);

	proto.port.push(&frame(Kind::Data, 1, 0, b"first"));
	proto.port.push(&frame(Kind::Data, 2, 0, b"second"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.recv_seq, 2);
	assert_eq!(sink.data.len(), 2);
	assert_eq!(sink.data[0].0, b"first");
	assert_eq!(sink.data[0].3, 0);
	assert_eq!(sink.data[1].0, b"second");
	assert_eq!(sink.data[1].3, 5);
}

#[test]
fn selective_nak() {
	let (mut proto, mut sink) = started(1024, 16);

	for seq in 1..=5 {
		proto.port.push(&frame(Kind::Data, seq, 0, b"x"));
	}
	pump(&mut proto);
	proto.process(&mut sink).unwrap();
	assert_eq!(proto.recv_seq, 5);

	// Sequence 8 arrives early: parked, and the gap is NAKed once.
	let mark = proto.port.outbound.len();
	proto.port.push(&frame(Kind::Data, 8, 0, b"eight"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert!(proto.recv_bufs[8].is_some());
	assert!(proto.naked[6] && proto.naked[7]);
	assert_eq!(naks(&proto.port.outbound[mark..]), [6, 7]);

	// Sequence 6 arrives: delivered immediately; 8 stays parked behind 7.
	proto.port.push(&frame(Kind::Data, 6, 0, b"six"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.recv_seq, 6);
	assert!(proto.recv_bufs[8].is_some());
	assert_eq!(sink.data.last().unwrap().0, b"six");

	// Sequence 7 closes the gap and 8 drains right behind it.
	proto.port.push(&frame(Kind::Data, 7, 0, b"seven"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.recv_seq, 8);
	assert!(proto.recv_bufs[8].is_none());
	assert_eq!(sink.data.last().unwrap().0, b"eight");
}

#[test]
fn crc_failure_naks_and_resyncs() {
	let (mut proto, mut sink) = started(1024, 16);

	// A well-framed packet with a checksum that cannot match.
	let mut bad = Header {
		kind: Kind::Data,
		caller: false,
		seq: 1,
		local_chan: 0,
		ack: 0,
		remote_chan: 0,
		len: 7,
	}
	.encode()
	.to_vec();
	bad.extend_from_slice(b"payload");
	bad.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

	let mark = proto.port.outbound.len();
	proto.port.push(&bad);
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.counters.bad_cksum, 1);
	assert!(proto.naked[1]);
	assert_eq!(naks(&proto.port.outbound[mark..]), [1]);
	assert!(sink.data.is_empty());
	assert!(proto.ring.is_empty());

	// The retransmission goes through cleanly.
	proto.port.push(&frame(Kind::Data, 1, 0, b"payload"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.recv_seq, 1);
	assert_eq!(sink.data[0].0, b"payload");
}

#[test]
fn bad_header_skips_one_byte() {
	let (mut proto, mut sink) = started(1024, 16);

	let mut bad = frame(Kind::Data, 1, 0, b"z");
	bad[5] ^= 0xff;
	proto.port.push(&bad);
	proto.port.push(&frame(Kind::Data, 1, 0, b"z"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert!(proto.counters.bad_hdr >= 1);
	assert_eq!(proto.recv_seq, 1);
	assert_eq!(sink.data.len(), 1);
}

#[test]
fn own_echo_is_rejected() {
	let (mut proto, mut sink) = started(1024, 16);

	// A frame carrying our own direction bit, as a half-duplex line that
	// echoes would produce.
	let echo = Header {
		kind: Kind::Data,
		caller: true,
		seq: 1,
		local_chan: 0,
		ack: 0,
		remote_chan: 0,
		len: 0,
	}
	.encode()
	.to_vec();

	proto.port.push(&echo);
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.counters.bad_hdr, 1);
	assert_eq!(proto.recv_seq, 0);
}

#[test]
fn duplicates_are_dropped() {
	let (mut proto, mut sink) = started(1024, 16);

	proto.port.push(&frame(Kind::Data, 1, 0, b"once"));
	proto.port.push(&frame(Kind::Data, 1, 0, b"once"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(sink.data.len(), 1);
	assert_eq!(proto.counters.dups, 1);
	assert_eq!(proto.recv_seq, 1);
}

#[test]
fn window_blocks_and_retransmits() {
	let (mut proto, mut sink) = started(1024, 4);

	for _ in 0..4 {
		proto.space()[..2].copy_from_slice(b"ab");
		proto.send_data(2, 0, 0, None, &mut sink).unwrap();
	}
	assert_eq!(proto.send_seq, 5);

	// The window is full and no acks arrive: the next send retries the
	// oldest unacknowledged packet until the budget runs out.
	proto.space()[..2].copy_from_slice(b"cd");
	assert!(proto.send_data(2, 0, 0, None, &mut sink).is_err());

	assert_eq!(proto.counters.resent, 6);
	let first = sent_frames(&proto.port.outbound)
		.iter()
		.filter(|(h, _)| h.kind == Kind::Data && h.seq == 1)
		.count();
	assert_eq!(first, 7);
}

#[test]
fn ack_opens_window() {
	let (mut proto, mut sink) = started(1024, 4);

	for _ in 0..4 {
		proto.space()[..2].copy_from_slice(b"ab");
		proto.send_data(2, 0, 0, None, &mut sink).unwrap();
	}

	// A standalone ACK for everything in flight lets the fifth through.
	proto.port.push(&frame(Kind::Ack, 0, 4, &[]));
	proto.space()[..2].copy_from_slice(b"cd");
	proto.send_data(2, 0, 0, None, &mut sink).unwrap();

	assert_eq!(proto.remote_ack, 4);
	assert_eq!(proto.send_seq, 6);
	assert_eq!(proto.counters.resent, 0);
}

#[test]
fn piggybacked_ack_opens_window() {
	let (mut proto, mut sink) = started(1024, 4);

	for _ in 0..4 {
		proto.space()[..2].copy_from_slice(b"ab");
		proto.send_data(2, 0, 0, None, &mut sink).unwrap();
	}

	// A data packet from the peer carries the ack in its remote field.
	proto.port.push(&frame(Kind::Data, 1, 3, b"reply"));
	proto.space()[..2].copy_from_slice(b"cd");
	proto.send_data(2, 0, 0, None, &mut sink).unwrap();

	assert_eq!(proto.remote_ack, 3);
	assert_eq!(proto.send_seq, 6);
	assert_eq!(sink.data.last().unwrap().0, b"reply");
}

#[test]
fn nak_triggers_resend() {
	let (mut proto, mut sink) = started(1024, 8);

	proto.space()[..3].copy_from_slice(b"abc");
	proto.send_data(3, 0, 0, None, &mut sink).unwrap();
	proto.space()[..3].copy_from_slice(b"def");
	proto.send_data(3, 0, 0, None, &mut sink).unwrap();

	let mark = proto.port.outbound.len();
	proto.port.push(&frame(Kind::Nak, 1, 0, &[]));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.counters.resent, 1);
	assert_eq!(proto.counters.remote_rejects, 1);

	let resent = sent_frames(&proto.port.outbound[mark..]);
	assert_eq!(resent.len(), 1);
	assert_eq!(resent[0].0.seq, 1);
	assert_eq!(resent[0].1, b"abc");
}

#[test]
fn nak_for_unsent_packet_is_ignored() {
	let (mut proto, mut sink) = started(1024, 8);

	proto.space()[..3].copy_from_slice(b"abc");
	proto.send_data(3, 0, 0, None, &mut sink).unwrap();

	// A NAK for the sequence we have not sent yet.
	let mark = proto.port.outbound.len();
	proto.port.push(&frame(Kind::Nak, 2, 0, &[]));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(proto.counters.remote_rejects, 1);
	assert_eq!(proto.counters.resent, 0);
	assert!(sent_frames(&proto.port.outbound[mark..]).is_empty());
}

#[test]
fn spos_emitted_on_reposition() {
	let (mut proto, mut sink) = started(1024, 16);

	// Data claiming offset 100 while the stream is at 0.
	let mark = proto.port.outbound.len();
	proto.space()[..5].copy_from_slice(b"hello");
	proto.send_data(5, 0, 0, Some(100), &mut sink).unwrap();

	let sent = sent_frames(&proto.port.outbound[mark..]);
	assert_eq!(sent.len(), 2);
	assert_eq!(sent[0].0.kind, Kind::Spos);
	assert_eq!(sent[0].0.seq, 1);
	assert_eq!(sent[0].1, 100u32.to_be_bytes());
	assert_eq!(sent[1].0.kind, Kind::Data);
	assert_eq!(sent[1].0.seq, 2);
	assert_eq!(sent[1].1, b"hello");

	assert_eq!(proto.send_pos, 105);
	assert_eq!(proto.send_seq, 3);

	// The next in-sequence chunk needs no SPOS.
	let mark = proto.port.outbound.len();
	proto.space()[..2].copy_from_slice(b"!!");
	proto.send_data(2, 0, 0, Some(105), &mut sink).unwrap();

	let sent = sent_frames(&proto.port.outbound[mark..]);
	assert_eq!(sent.len(), 1);
	assert_eq!(sent[0].0.kind, Kind::Data);
}

#[test]
fn spos_moves_receive_position() {
	let (mut proto, mut sink) = started(1024, 16);

	proto.port.push(&frame(Kind::Spos, 1, 0, &4096u32.to_be_bytes()));
	proto.port.push(&frame(Kind::Data, 2, 0, b"resumed"));
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	assert_eq!(sink.data.len(), 1);
	assert_eq!(sink.data[0].0, b"resumed");
	assert_eq!(sink.data[0].3, 4096);
	assert_eq!(proto.recv_pos, 4096 + 7);
}

#[test]
fn zero_length_data_reports_completion() {
	let (mut proto, mut sink) = started(1024, 16);
	sink.exit_on_empty = true;

	proto.port.push(&frame(Kind::Data, 1, 0, b"tail"));
	proto.port.push(&frame(Kind::Data, 2, 0, &[]));
	pump(&mut proto);
	let exit = proto.process(&mut sink).unwrap();

	assert!(exit);
	assert_eq!(sink.data.len(), 2);
	assert!(sink.data[1].0.is_empty());
	// An empty payload does not advance the file position.
	assert_eq!(proto.recv_pos, 4);
}

#[test]
fn remote_close_exits() {
	let (mut proto, mut sink) = started(1024, 16);

	proto.port.push(&frame(Kind::Close, 1, 0, &[]));
	pump(&mut proto);
	let exit = proto.process(&mut sink).unwrap();

	assert!(exit);
	assert_eq!(proto.state, State::Closed);
}

#[test]
fn shutdown_sends_close_and_resets() {
	let (mut proto, _) = started(1024, 16);

	let mut params = Params::default();
	params.set("timeout", 3).unwrap();
	proto.params = params;

	proto.shutdown().unwrap();

	let sent = sent_frames(&proto.port.outbound);
	let last = sent.last().unwrap();
	assert_eq!(last.0.kind, Kind::Close);
	assert_eq!(last.0.seq, proto.send_seq);

	assert_eq!(proto.state, State::Closed);
	assert_eq!(proto.params, Params::default());
}

#[test]
fn standalone_ack_at_half_window() {
	let (mut proto, mut sink) = started(1024, 8);

	// Receiving only (no outbound data to piggy-back on): after half the
	// window, a standalone ACK goes out.
	let mark = proto.port.outbound.len();
	for seq in 1..=4 {
		proto.port.push(&frame(Kind::Data, seq, 0, b"chunk"));
	}
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	let acks: Vec<u8> = sent_frames(&proto.port.outbound[mark..])
		.iter()
		.filter(|(h, _)| h.kind == Kind::Ack)
		.map(|(h, _)| h.ack)
		.collect();
	assert_eq!(acks, [4]);
	assert_eq!(proto.local_ack, 4);
}

#[test]
fn oversized_payload_is_refused() {
	let (mut proto, mut sink) = started(512, 8);

	// Exactly the negotiated packet size is fine; one more byte is not.
	assert_eq!(proto.space().len(), 512);
	proto.space().fill(0x11);
	proto.send_data(512, 0, 0, None, &mut sink).unwrap();

	assert!(proto.send_data(513, 0, 0, None, &mut sink).is_err());
	assert!(proto.send_data(0, 9, 0, None, &mut sink).is_err());
}

#[test]
fn sequence_numbers_wrap() {
	let (mut proto, mut sink) = started(1024, 8);

	for i in 0..40u32 {
		// Keep the window open by acknowledging as we go.
		let acked = (proto.send_seq + 31) % 32;
		proto.port.push(&frame(Kind::Ack, 0, acked, &[]));

		let chunk = [i as u8; 4];
		proto.space()[..4].copy_from_slice(&chunk);
		proto.send_data(4, 0, 0, None, &mut sink).unwrap();
	}

	// 40 sends from initial sequence 1 wrap the space.
	assert_eq!(proto.send_seq, (1 + 40) % 32);
	assert_eq!(proto.counters.sent, 40);
	assert_eq!(proto.counters.resent, 0);
}

#[test]
fn payload_crc_across_ring_wrap() {
	let (mut proto, mut sink) = started(1024, 16);

	// Enough maximal frames to lap the receive ring several times; at least
	// one payload ends up split across the wrap.
	let mut expect = Vec::new();
	let mut seq = 0;
	for i in 0..24u32 {
		seq = next_seq(seq);
		let payload = vec![i as u8 + 1; 1024];
		proto.port.push(&frame(Kind::Data, seq, 0, &payload));
		expect.push(payload);

		pump(&mut proto);
		proto.process(&mut sink).unwrap();
	}

	assert_eq!(proto.counters.bad_cksum, 0);
	assert_eq!(proto.counters.received, 24);
	assert_eq!(sink.data.len(), 24);
	for (got, want) in sink.data.iter().zip(&expect) {
		assert_eq!(&got.0, want);
	}
}

#[test]
fn error_budget_is_enforced() {
	let mut port = TestPort::new();
	port.push(&sync(1024, 16));

	let mut params = Params::default();
	params.set("errors", 2).unwrap();

	let mut proto = Iproto::new(port, true, params);
	let mut sink = TestSink::default();
	proto.start(&mut sink).unwrap();

	// Each corrupt header costs one error; the third breaks the budget.
	for _ in 0..3 {
		let mut bad = frame(Kind::Data, 1, 0, &[]);
		bad[5] ^= 0xff;
		proto.port.push(&bad);
	}
	pump(&mut proto);

	assert!(proto.process(&mut sink).is_err());
	assert_eq!(proto.counters.bad_hdr, 3);
}

#[test]
fn channels_are_routed_through() {
	let (mut proto, mut sink) = started(1024, 16);

	let mut f = Header {
		kind: Kind::Data,
		caller: false,
		seq: 1,
		local_chan: 3,
		ack: 0,
		remote_chan: 5,
		len: 2,
	}
	.encode()
	.to_vec();
	f.extend_from_slice(b"ch");
	f.extend_from_slice(&crc(b"ch"));

	proto.port.push(&f);
	pump(&mut proto);
	proto.process(&mut sink).unwrap();

	// The peer's remote field names our channel; its local field names its
	// own.
	let (_, local, remote, _) = &sink.data[0];
	assert_eq!(*local, 5);
	assert_eq!(*remote, 3);
}
