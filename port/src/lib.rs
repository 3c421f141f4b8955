use std::io::{self, ErrorKind};
use std::time::{Duration, Instant};

use log::{error, warn};
use utils::error::*;

pub mod logger;

#[cfg(target_family = "unix")]
mod sys {
	pub use std::os::fd::{AsRawFd, RawFd};

	pub use libc::{c_void as BufType, poll, pollfd as Poll, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_fd()
	}

	/// Ports may be sockets, pipes or terminal lines, so plain read/write.
	pub unsafe fn rd(fd: RawFd, buf: *mut BufType, len: usize) -> isize {
		libc::read(fd, buf, len)
	}

	pub unsafe fn wr(fd: RawFd, buf: *const BufType, len: usize) -> isize {
		libc::write(fd, buf, len)
	}
}

#[cfg(target_family = "windows")]
mod sys {
	pub use std::os::windows::io::AsRawSocket as AsRawFd;

	pub type BufType = u8;
	pub use windows_sys::Win32::Networking::WinSock::{
		recv, send, WSAPoll as poll, POLLERR, POLLHUP, POLLNVAL, POLLRDNORM as POLLIN, POLLWRNORM as POLLOUT, SOCKET as RawFd, WSAPOLLFD as Poll,
	};

	pub fn as_raw<T: AsRawFd>(t: &T) -> RawFd {
		t.as_raw_socket() as _
	}

	pub unsafe fn rd(fd: RawFd, buf: *mut BufType, len: usize) -> isize {
		recv(fd, buf, len as _, 0) as isize
	}

	pub unsafe fn wr(fd: RawFd, buf: *const BufType, len: usize) -> isize {
		send(fd, buf, len as _, 0) as isize
	}
}

pub use sys::AsRawFd;
use sys::*;

/// An opaque bidirectional byte stream carrying the protocol.
///
/// Any underlying I/O error is fatal to the session; the implementation logs
/// the particulars and the session unwinds with `Err(())`.
pub trait Port {
	/// Writes from `send` and reads into `recv` simultaneously, blocking until
	/// at least one direction makes progress. Returns `(sent, received)`.
	fn io(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(usize, usize)>;

	/// Reads at least `min` bytes into `recv`, giving up when `timeout`
	/// elapses. Returns however many bytes arrived; `0` means the timeout
	/// expired with nothing received. `report` controls whether an empty
	/// timeout is logged.
	fn read(&mut self, recv: &mut [u8], min: usize, timeout: Duration, report: bool) -> Result<usize>;
}

fn as_timeout(t: Option<Duration>) -> i32 {
	t.and_then(|d| d.as_millis().try_into().ok()).unwrap_or(-1)
}

fn ret_to_err(val: isize) -> Result<Option<usize>> {
	match TryInto::<usize>::try_into(val) {
		Ok(n) => Ok(Some(n)),
		Err(_) => {
			let err = io::Error::last_os_error();

			if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
				return Ok(None);
			}

			error!("I/O operation failed: {err}");
			Err(())
		}
	}
}

fn write_some(fd: RawFd, buf: &[u8]) -> Result<Option<usize>> {
	let r = unsafe { wr(fd, buf.as_ptr() as *const BufType, buf.len()) };
	ret_to_err(r)
}

fn read_some(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
	let r = unsafe { rd(fd, buf.as_mut_ptr() as *mut BufType, buf.len()) };
	ret_to_err(r)
}

fn poll_fd(fd: RawFd, events: i16, timeout: Option<Duration>) -> Result<i16> {
	let mut pfd = Poll { fd, events, revents: 0 };

	let ret = loop {
		let ret = unsafe { poll(&mut pfd, 1, as_timeout(timeout)) };

		if ret >= 0 {
			break ret;
		}

		let err = io::Error::last_os_error();

		if err.kind() != ErrorKind::Interrupted {
			error!("poll() failed: {err}");
			return Err(());
		}
	};

	if ret == 0 {
		return Ok(0);
	}

	if pfd.revents & POLLNVAL != 0 {
		error!("Port descriptor is invalid");
		return Err(());
	}

	Ok(pfd.revents)
}

/// A `Port` over any pollable descriptor. The descriptor must already be in
/// nonblocking mode; blocking happens in `poll` so that reads and writes can
/// be interleaved against a half-duplex line.
pub struct Io<T: AsRawFd> {
	inner: T,
}

impl<T: AsRawFd> Io<T> {
	pub fn new(inner: T) -> Self {
		Self { inner }
	}

	pub fn get_ref(&self) -> &T {
		&self.inner
	}
}

impl<T: AsRawFd> Port for Io<T> {
	fn io(&mut self, send: &[u8], recv: &mut [u8]) -> Result<(usize, usize)> {
		let fd = as_raw(&self.inner);

		let mut events = 0;
		if !send.is_empty() {
			events |= POLLOUT;
		}
		if !recv.is_empty() {
			events |= POLLIN;
		}
		if events == 0 {
			return Ok((0, 0));
		}

		loop {
			let revents = poll_fd(fd, events, None)?;

			let mut sent = 0;
			let mut received = 0;

			if revents & POLLOUT != 0 {
				if let Some(n) = write_some(fd, send)? {
					sent = n;
				}
			}

			if revents & (POLLIN | POLLHUP | POLLERR) != 0 && !recv.is_empty() {
				match read_some(fd, recv)? {
					Some(0) => {
						error!("Line disconnected");
						return Err(());
					}
					Some(n) => received = n,
					None => {}
				}
			}

			if sent > 0 || received > 0 {
				return Ok((sent, received));
			}
		}
	}

	fn read(&mut self, recv: &mut [u8], min: usize, timeout: Duration, report: bool) -> Result<usize> {
		let fd = as_raw(&self.inner);
		let deadline = Instant::now() + timeout;
		let min = min.min(recv.len());

		let mut total = 0;

		while total < min {
			let now = Instant::now();
			if now >= deadline {
				break;
			}

			if poll_fd(fd, POLLIN, Some(deadline - now))? == 0 {
				break;
			}

			match read_some(fd, &mut recv[total..])? {
				Some(0) => {
					error!("Line disconnected");
					return Err(());
				}
				Some(n) => total += n,
				None => {}
			}
		}

		if total == 0 && report {
			warn!("Timed out waiting for data");
		}

		Ok(total)
	}
}
