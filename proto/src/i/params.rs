use log::warn;
use utils::error::*;

/// Tunable protocol parameters, all recognized by their configuration names.
/// The remote sizes are overrides: zero leaves them to SYNC negotiation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Params {
	/// Packet size to ask the peer to send ("packet-size").
	pub packet_size: u16,
	/// Window size to ask the peer to use ("window").
	pub window: u8,
	/// Forced remote packet size ("remote-packet-size").
	pub remote_packet_size: u16,
	/// Forced remote window size ("remote-window").
	pub remote_window: u8,
	/// Seconds to wait for the peer's SYNC ("sync-timeout").
	pub sync_timeout: u32,
	/// SYNC retransmissions before startup fails ("sync-retries").
	pub sync_retries: u32,
	/// Seconds to wait for any other packet ("timeout").
	pub timeout: u32,
	/// Consecutive timeouts before the session fails ("retries").
	pub retries: u32,
	/// Error budget; negative disables the check ("errors").
	pub errors: i64,
	/// Packets received per error forgiven ("error-decay").
	pub error_decay: i64,
}

impl Default for Params {
	fn default() -> Self {
		Self {
			packet_size: 1024,
			window: 16,
			remote_packet_size: 0,
			remote_window: 0,
			sync_timeout: 10,
			sync_retries: 6,
			timeout: 10,
			retries: 6,
			errors: 100,
			error_decay: 10,
		}
	}
}

impl Params {
	/// Assigns one parameter by its configuration name.
	pub fn set(&mut self, name: &str, value: i64) -> Result {
		fn int<T: TryFrom<i64>>(name: &str, value: i64) -> Result<T> {
			T::try_from(value).or_fail(|_| warn!("Value {value} is out of range for parameter {name}"))
		}

		match name {
			"packet-size" => self.packet_size = int(name, value)?,
			"window" => self.window = int(name, value)?,
			"remote-packet-size" => self.remote_packet_size = int(name, value)?,
			"remote-window" => self.remote_window = int(name, value)?,
			"sync-timeout" => self.sync_timeout = int(name, value)?,
			"sync-retries" => self.sync_retries = int(name, value)?,
			"timeout" => self.timeout = int(name, value)?,
			"retries" => self.retries = int(name, value)?,
			"errors" => self.errors = value,
			"error-decay" => self.error_decay = value,
			_ => {
				warn!("Unknown protocol parameter {name}");
				return Err(());
			}
		}

		Ok(())
	}
}
