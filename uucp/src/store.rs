use std::io::{Read, Seek, Write};

use utils::error::*;

/// Why a transfer request is being refused; maps onto the numbered refusal
/// responses on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
	/// Permission denied.
	Perm,
	/// Work files cannot be created.
	Open,
	/// The file is too large.
	Size,
	Other,
}

/// A readable file being sent. The daemon owns the handle; seeking supports
/// restarted transfers.
pub trait FileSource: Read + Seek {}

impl<T: Read + Seek> FileSource for T {}

/// A writable file being received.
pub trait FileSink: Write + Seek {}

impl<T: Write + Seek> FileSink for T {}

/// The storage collaborator. Spool bookkeeping and final file placement are
/// not the protocol's business; the daemon only reports transfer lifecycle
/// events through this trait.
pub trait Store {
	/// A file transfer out is beginning. `seq` identifies the work item.
	fn store_sendfile(&mut self, seq: u64, from: &str, to: &str, sys: &str, user: &str, mail: &str) -> Result;

	/// A file transfer in is beginning.
	fn store_recfile(&mut self, seq: u64, from: &str, to: &str, sys: &str, user: &str, mode: u32, mail: &str, temp: &str) -> Result;

	/// A sent file finished, successfully or not.
	fn sent_file(&mut self, ok: bool, bytes: u64);

	/// A received file finished; move it into its final location. Returns
	/// whether the placement succeeded.
	fn received_file(&mut self, ok: bool, bytes: u64) -> bool;
}
