use log::warn;

/// The request being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	/// `S`: the sender asks to transfer a file here.
	Send,
	/// `R`: the requester asks for a file from here.
	Receive,
	/// `X`: work to be passed on to another system.
	Xfer,
	/// `H`: a hangup request.
	Hangup,
	/// `HY`: the peer confirms a hangup.
	HangupYes,
	/// `HN`: the peer denies a hangup.
	HangupNo,
}

/// One transfer request, parsed from or serialized to the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
	pub kind: Kind,
	pub from: String,
	pub to: String,
	pub user: String,
	/// Option letters, carried without the leading dash.
	pub options: String,
	/// The sender's temporary file name; sent but ignored by the receiver.
	pub temp: String,
	/// Octal file permissions.
	pub mode: u32,
	/// Who to notify on completion; may be empty.
	pub notify: String,
	/// File size for `S`, or the largest acceptable size for `R`.
	pub size: Option<u64>,
	/// Opaque work-queue identifier; never serialized.
	pub seq: u64,
}

impl Cmd {
	pub fn new(kind: Kind) -> Self {
		Self {
			kind,
			from: String::new(),
			to: String::new(),
			user: String::new(),
			options: String::new(),
			temp: String::new(),
			mode: 0,
			notify: String::new(),
			size: None,
			seq: 0,
		}
	}

	/// Parses a command string received from the peer. Returns `None` (and
	/// logs) for anything garbled.
	pub fn parse(line: &str) -> Option<Self> {
		let mut words = line.split_ascii_whitespace();

		let cmd = match words.next() {
			Some("H") => Some(Self::new(Kind::Hangup)),
			Some("HY") => Some(Self::new(Kind::HangupYes)),
			Some("HN") => Some(Self::new(Kind::HangupNo)),
			Some(word @ ("S" | "R" | "X")) => {
				let kind = match word {
					"S" => Kind::Send,
					"R" => Kind::Receive,
					_ => Kind::Xfer,
				};

				let mut cmd = Self::new(kind);
				cmd.from = words.next()?.into();
				cmd.to = words.next()?.into();
				cmd.user = words.next()?.into();
				cmd.options = words.next()?.strip_prefix('-')?.into();

				match kind {
					Kind::Send => {
						cmd.temp = words.next()?.into();
						cmd.mode = u32::from_str_radix(words.next()?, 8).ok()?;
						if let Some(notify) = words.next() {
							if notify != "\"\"" {
								cmd.notify = notify.into();
							}
						}
						if let Some(size) = words.next() {
							cmd.size = Some(size.parse().ok()?);
						}
					}
					Kind::Receive => {
						if let Some(size) = words.next() {
							cmd.size = Some(size.parse().ok()?);
						}
					}
					_ => {}
				}

				Some(cmd)
			}
			_ => None,
		};

		if cmd.is_none() {
			warn!("Received garbled command {line:?}");
		}

		cmd
	}

	/// The `S` request string. The extended form appends the size, with a
	/// `""` placeholder keeping the notify field unambiguous.
	pub fn send_request(&self, sizes: bool) -> String {
		if !sizes {
			format!(
				"S {} {} {} -{} {} 0{:o} {}",
				self.from, self.to, self.user, self.options, self.temp, self.mode, self.notify
			)
		} else {
			let notify = if self.notify.is_empty() { "\"\"" } else { &self.notify };
			format!(
				"S {} {} {} -{} {} 0{:o} {} {}",
				self.from,
				self.to,
				self.user,
				self.options,
				self.temp,
				self.mode,
				notify,
				self.size.unwrap_or(0)
			)
		}
	}

	/// The `R` request string; the extended form carries the largest file
	/// size the requester is prepared to accept.
	pub fn receive_request(&self, sizes: bool) -> String {
		if !sizes {
			format!("R {} {} {} -{}", self.from, self.to, self.user, self.options)
		} else {
			format!("R {} {} {} -{} {}", self.from, self.to, self.user, self.options, self.size.unwrap_or(0))
		}
	}

	/// The `X` request string.
	pub fn xfer_request(&self) -> String {
		format!("X {} {} {} -{}", self.from, self.to, self.user, self.options)
	}
}
