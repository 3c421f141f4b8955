use utils::error::*;

pub mod i;

/// Upcalls from a transport protocol into the command layer.
pub trait Sink {
	/// Delivers the payload of one in-order data packet. The payload arrives
	/// as two slices because it may wrap the receive ring; either may be
	/// empty, and a payload of zero total length marks the end of the
	/// current file. `pos` is the file offset the payload starts at.
	///
	/// The slices are only valid for the duration of the call; the receiver
	/// copies whatever it keeps. Returns `true` once the payload completed a
	/// command or a file, which tells the protocol's wait loop to return to
	/// its caller.
	fn got_data(&mut self, first: &[u8], second: &[u8], local_chan: u8, remote_chan: u8, pos: u64) -> Result<bool>;
}

/// The capability surface of a transport protocol.
///
/// The command layer drives transfers exclusively through this trait, so
/// protocols are interchangeable behind `Box<dyn Protocol>`. Every entry
/// point that can pull packets off the line takes the upward `Sink`, since
/// sending and receiving are interleaved on the wire.
pub trait Protocol {
	/// Performs the protocol handshake. Must be called before anything else.
	fn start(&mut self, sink: &mut dyn Sink) -> Result;

	/// Sends the closing packet and retires the session.
	fn shutdown(&mut self) -> Result;

	/// Sends a NUL-terminated command string as one or more data packets.
	fn send_cmd(&mut self, cmd: &str, local_chan: u8, remote_chan: u8, sink: &mut dyn Sink) -> Result;

	/// A writable region inside the next outgoing packet. The caller fills a
	/// prefix and hands the length to `send_data`.
	fn space(&mut self) -> &mut [u8];

	/// Transmits `len` bytes previously written into `space`. `pos` is the
	/// absolute file offset of the data, or `None` when the data has no file
	/// position (commands).
	fn send_data(&mut self, len: usize, local_chan: u8, remote_chan: u8, pos: Option<u64>, sink: &mut dyn Sink) -> Result;

	/// Blocks until at least one packet has been fully processed, or an
	/// unrecoverable error occurs. Callers loop on this; anything a packet
	/// changed (queued commands, window state, file data) is visible when it
	/// returns.
	fn wait(&mut self, sink: &mut dyn Sink) -> Result;

	/// Drains already-buffered input without reading from the port. Returns
	/// whether the sink reported a completion.
	fn process(&mut self, sink: &mut dyn Sink) -> Result<bool>;
}
