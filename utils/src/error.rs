use core::result;

/// The workspace-wide result type.
///
/// Failures are reported to the log stream at the point of detection, so the
/// error channel itself carries no payload. A function returning `Err(())`
/// has already said everything it has to say.
pub type Result<T = (), E = ()> = result::Result<T, E>;

pub trait Ext<T, E> {
	/// Hands the error to `f` (typically a logging closure) and erases it.
	fn or_fail(self, f: impl FnOnce(E)) -> Result<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn or_fail(self, f: impl FnOnce(E)) -> Result<T> {
		match self {
			Ok(v) => Ok(v),
			Err(e) => {
				f(e);
				Err(())
			}
		}
	}
}

pub trait ExtOpaque<T> {
	/// Calls `f` if the value is absent, then converts to a `Result`.
	fn some_or(self, f: impl FnOnce()) -> Result<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Result<T> {
		match self {
			Some(v) => Ok(v),
			None => {
				f();
				Err(())
			}
		}
	}
}

pub use Ext as _;
