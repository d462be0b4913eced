//! Provide interoperability with C return values.

use std::io::{self, Error as IoError};

/// Converts a C return value to a Rust `Result`.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => from_c_err(ret),
    }
}

/// Converts a non-zero C return value to a Rust `Result`.
///
/// `librdmacm` routines return `-1` with `errno` set, while `libibverbs`
/// post/poll routines return the error number directly. Treat `-1` as
/// "consult errno" and positive values as errno themselves.
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    if code == -1 {
        Err(IoError::last_os_error())
    } else {
        Err(IoError::from_raw_os_error(code.abs()))
    }
}
