use std::io::{Read, Seek, SeekFrom, Write};

use log::{debug, error};
use proto::{Protocol, Sink};
use utils::error::*;

use crate::cmd::{Cmd, Kind};
use crate::queue::CmdQueue;
use crate::store::{Failure, FileSink, FileSource, Store};

/// Inbound routing state, and the `Sink` the protocol engine delivers into.
/// Payload bytes belong to the open receive file when there is one, and to
/// the command accumulator otherwise.
struct Inbound<S> {
	store: S,
	recvfile: Option<Box<dyn FileSink>>,
	cmds: CmdQueue,
	received_bytes: u64,
	/// Offset the next payload is expected at; a mismatch seeks.
	recv_offset: u64,
	/// A local write failed. Logged once; the transfer keeps consuming data
	/// and confirms negatively at the end.
	recv_error: bool,
	/// The zero-length terminator arrived.
	recv_done: bool,
}

impl<S: Store> Sink for Inbound<S> {
	fn got_data(&mut self, first: &[u8], second: &[u8], _local_chan: u8, _remote_chan: u8, pos: u64) -> Result<bool> {
		let Some(file) = self.recvfile.as_mut() else {
			return Ok(self.cmds.add(first, second));
		};

		let len = (first.len() + second.len()) as u64;

		if len == 0 {
			self.recv_done = true;
			return Ok(true);
		}

		// A restarted or repositioned transfer announces its offset.
		if pos != self.recv_offset {
			debug!("seeking receive file to {pos}");
			if file.seek(SeekFrom::Start(pos)).is_err() && !self.recv_error {
				error!("seek failed on receive file");
				self.recv_error = true;
			}
			self.recv_offset = pos;
		}

		for part in [first, second] {
			if part.is_empty() {
				continue;
			}

			if let Err(err) = file.write_all(part) {
				if !self.recv_error {
					error!("write: {err}");
					self.recv_error = true;
				}
			}
		}

		self.received_bytes += len;
		self.recv_offset += len;

		Ok(false)
	}
}

/// One session of the file-exchange daemon: a transport protocol below, the
/// storage collaborator beside, and at most one file moving in each
/// direction.
pub struct Daemon<S> {
	proto: Box<dyn Protocol>,
	sendfile: Option<Box<dyn FileSource>>,
	/// Offset within the file being sent.
	send_offset: u64,
	sent_bytes: u64,
	inbound: Inbound<S>,
}

impl<S: Store> Daemon<S> {
	pub fn new(proto: Box<dyn Protocol>, store: S) -> Self {
		Self {
			proto,
			sendfile: None,
			send_offset: 0,
			sent_bytes: 0,
			inbound: Inbound {
				store,
				recvfile: None,
				cmds: CmdQueue::default(),
				received_bytes: 0,
				recv_offset: 0,
				recv_error: false,
				recv_done: false,
			},
		}
	}

	/// Runs the transport handshake. Everything else requires it.
	pub fn start(&mut self) -> Result {
		self.proto.start(&mut self.inbound)
	}

	pub fn store(&mut self) -> &mut S {
		&mut self.inbound.store
	}

	/// The next complete command string, waiting for traffic as needed.
	fn get_response(&mut self) -> Result<String> {
		loop {
			if let Some(line) = self.inbound.cmds.next() {
				debug!("got command {line:?}");
				return Ok(line);
			}

			self.proto.wait(&mut self.inbound)?;
		}
	}

	/// The next request from the peer, with hangup replies handled in
	/// place: `HN` denies a hangup and is otherwise ignored, and `HY` walks
	/// the confirmation exchange before shutting the protocol down.
	pub fn get_cmd(&mut self, master: bool) -> Result<Cmd> {
		loop {
			let line = self.get_response()?;

			let Some(cmd) = Cmd::parse(&line) else {
				continue;
			};

			match cmd.kind {
				Kind::HangupNo => {
					if master {
						error!("Got hangup reply as master");
					}
				}
				Kind::HangupYes => {
					if master {
						error!("Got hangup reply as master");
					}

					// The peer may jump the gun and drop the line before
					// the exchange finishes; that is not a failure.
					if self.proto.send_cmd("HY", 0, 0, &mut self.inbound).is_err() {
						return Ok(cmd);
					}
					match self.get_response() {
						Err(()) => return Ok(cmd),
						Ok(line) => {
							if line != "HY" {
								error!("Got {line:?} when expecting \"HY\"");
							}
						}
					}

					let _ = self.proto.shutdown();
					return Ok(cmd);
				}
				_ => return Ok(cmd),
			}
		}
	}

	/// Sends a file. A master first asks permission with an `S` request; a
	/// slave is answering a master's `R` request and confirms with `RY`.
	/// Communication failure is `Err`; a refused transfer closes the file,
	/// leaves the session intact and returns `Ok`.
	pub fn send_file(&mut self, master: bool, mut file: Box<dyn FileSource>, cmd: &Cmd, mail: &str, tosys: &str, sizes: bool) -> Result {
		if master {
			let request = cmd.send_request(sizes);
			self.proto.send_cmd(&request, 0, 0, &mut self.inbound)?;

			let response = self.get_response()?;

			if !matches!(response.as_bytes(), [b'S', b'Y' | b'N', ..]) {
				error!("Bad response to send request");
				return Err(());
			}

			if response.as_bytes()[1] == b'N' {
				match response.as_bytes().get(2) {
					Some(b'2') => error!("Can't send {}: permission denied", cmd.from),
					// The remote cannot make work files right now; retry on
					// a later call.
					Some(b'4') => error!("Can't send {}: remote cannot create work files", cmd.from),
					Some(b'6') => error!("{} is too big to send now", cmd.from),
					_ => error!("Can't send {}: unknown reason", cmd.from),
				}
				return Ok(());
			}
		} else {
			let confirm = format!("RY 0{:o}", cmd.mode);
			self.proto.send_cmd(&confirm, 0, 0, &mut self.inbound)?;
		}

		// A handle positioned past the start is a restarted transfer.
		let offset = file.stream_position().or_fail(|err| error!("seek: {err}"))?;

		self.inbound
			.store
			.store_sendfile(cmd.seq, &cmd.from, &cmd.to, tosys, &cmd.user, mail)?;

		self.sendfile = Some(file);
		self.send_offset = offset;
		self.sent_bytes = 0;

		self.ploop()
	}

	/// Receives a file; the mirror of `send_file`. A master asks with an
	/// `R` request; a slave confirms a master's `S` request with `SY`.
	pub fn receive_file(&mut self, master: bool, file: Box<dyn FileSink>, cmd: &Cmd, mail: &str, fromsys: &str, sizes: bool) -> Result {
		let mode;

		if master {
			let request = cmd.receive_request(sizes);
			self.proto.send_cmd(&request, 0, 0, &mut self.inbound)?;

			let response = self.get_response()?;

			if !matches!(response.as_bytes(), [b'R', b'Y' | b'N', ..]) {
				error!("Bad response to receive request");
				return Err(());
			}

			if response.as_bytes()[1] == b'N' {
				match response.as_bytes().get(2) {
					Some(b'2') => error!("Can't receive {}: no such file", cmd.from),
					// Larger than the maximum we offered; retry later.
					Some(b'6') => error!("{} is too big to receive", cmd.from),
					_ => error!("Can't receive {}: unknown reason", cmd.from),
				}
				return Ok(());
			}

			// The mode arrives as `RY 0mode`; 0666 when absent or zero.
			mode = match u32::from_str_radix(response[2..].trim_start(), 8) {
				Ok(0) | Err(_) => 0o666,
				Ok(mode) => mode,
			};
		} else {
			self.proto.send_cmd("SY", 0, 0, &mut self.inbound)?;
			mode = cmd.mode;
		}

		self.inbound
			.store
			.store_recfile(cmd.seq, &cmd.from, &cmd.to, fromsys, &cmd.user, mode, mail, &cmd.temp)?;

		self.inbound.recvfile = Some(file);
		self.inbound.received_bytes = 0;
		self.inbound.recv_offset = 0;
		self.inbound.recv_error = false;
		self.inbound.recv_done = false;

		self.ploop()
	}

	/// Sends an `X` request and awaits the verdict. Refusal leaves the
	/// session intact.
	pub fn xfer_request(&mut self, cmd: &Cmd) -> Result {
		self.proto.send_cmd(&cmd.xfer_request(), 0, 0, &mut self.inbound)?;

		let response = self.get_response()?;

		if !matches!(response.as_bytes(), [b'X', b'Y' | b'N', ..]) {
			error!("Bad response to transfer request");
			return Err(());
		}

		if response.as_bytes()[1] == b'N' {
			error!("Work request denied");
		}

		Ok(())
	}

	/// Confirms a peer's `X` request.
	pub fn xfer_confirm(&mut self) -> Result {
		self.proto.send_cmd("XY", 0, 0, &mut self.inbound)
	}

	/// Refuses a transfer request, naming the reason. Slave side only.
	pub fn transfer_fail(&mut self, request: Kind, why: Failure) -> Result {
		let response = match request {
			Kind::Send => match why {
				Failure::Perm => "SN2",
				Failure::Open => "SN4",
				Failure::Size => "SN6",
				Failure::Other => "SN",
			},
			Kind::Receive => match why {
				Failure::Perm | Failure::Open => "RN2",
				Failure::Size => "RN6",
				Failure::Other => "RN",
			},
			Kind::Xfer => "XN",
			_ => {
				error!("transfer_fail: request {request:?} cannot fail");
				return Err(());
			}
		};

		self.proto.send_cmd(response, 0, 0, &mut self.inbound)
	}

	/// Asks the peer to hang up. The reply arrives as a command.
	pub fn hangup_request(&mut self) -> Result {
		self.proto.send_cmd("H", 0, 0, &mut self.inbound)
	}

	/// Answers a hangup request. Confirming runs the redundant three-message
	/// `HY` exchange and shuts the protocol down; the redundancy tolerates a
	/// peer that closes the line after the first message.
	pub fn hangup_reply(&mut self, confirm: bool) -> Result {
		if !confirm {
			return self.proto.send_cmd("HN", 0, 0, &mut self.inbound);
		}

		self.proto.send_cmd("HY", 0, 0, &mut self.inbound)?;

		let line = self.get_response()?;
		if line != "HY" {
			error!("Got {line:?} when expecting \"HY\"");
		} else {
			self.proto.send_cmd("HY", 0, 0, &mut self.inbound)?;
		}

		self.proto.shutdown()
	}

	/// The data loop. With a file to send, pushes it until end of file or
	/// until a completed inbound command interrupts; otherwise drives the
	/// receive side to its terminator. An interrupted transfer stays open
	/// and resumes on the next call.
	pub fn ploop(&mut self) -> Result {
		if self.sendfile.is_some() {
			loop {
				let space = self.proto.space();
				let Some(file) = self.sendfile.as_mut() else {
					error!("ploop: send file disappeared");
					return Err(());
				};

				let n = match file.read(space) {
					Ok(n) => n,
					Err(err) => {
						// No way to tell the peer about a local read
						// failure; drop the connection.
						error!("read: {err}");
						self.inbound.store.sent_file(false, self.sent_bytes);
						self.sendfile = None;
						return Err(());
					}
				};

				let offset = self.send_offset;
				self.proto.send_data(n, 0, 0, Some(offset), &mut self.inbound)?;
				self.send_offset += n as u64;
				self.sent_bytes += n as u64;

				if n == 0 {
					return self.sendfile_confirm();
				}

				if self.inbound.cmds.ready() {
					return Ok(());
				}
			}
		}

		if self.inbound.recvfile.is_some() {
			loop {
				self.proto.wait(&mut self.inbound)?;

				if self.inbound.recv_done {
					return self.recfile_confirm();
				}

				if self.inbound.cmds.ready() {
					return Ok(());
				}
			}
		}

		error!("ploop: no file to transfer");
		Err(())
	}

	/// After the terminator, the receiving side reports placement: `CY`, or
	/// `CN5` when the file could not be stored.
	fn sendfile_confirm(&mut self) -> Result {
		let response = self.get_response()?;
		let ok;

		if !matches!(response.as_bytes(), [b'C', b'Y' | b'N', ..]) {
			error!("Bad confirmation for sent file");
			ok = false;
		} else if response.as_bytes()[1] == b'N' {
			if response.as_bytes().get(2) == Some(&b'5') {
				error!("File could not be stored in final location");
			} else {
				error!("File send failed for unknown reason");
			}
			ok = false;
		} else {
			ok = true;
		}

		self.inbound.store.sent_file(ok, self.sent_bytes);
		self.sendfile = None;

		Ok(())
	}

	/// Finalizes a received file and reports the outcome to the peer.
	fn recfile_confirm(&mut self) -> Result {
		let ok = !self.inbound.recv_error;
		let placed = self.inbound.store.received_file(ok, self.inbound.received_bytes);

		self.inbound.recvfile = None;
		self.inbound.recv_done = false;

		if ok && placed {
			self.proto.send_cmd("CY", 0, 0, &mut self.inbound)
		} else {
			self.proto.send_cmd("CN5", 0, 0, &mut self.inbound)
		}
	}
}
