//! Suppresses `SIGPIPE` on sockets where the platform raises it on write.

use tokio::net::TcpStream;

use crate::error::Result;

/// Sets `SO_NOSIGPIPE` on `stream`. Linux and Windows report
/// `EPIPE` without a signal, so this does nothing there.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub fn disable_sigpipe(stream: &TcpStream) -> Result<()> {
    use std::os::fd::AsRawFd;

    let fd = stream.as_raw_fd();
    let one: libc::c_int = 1;
    // SAFETY: `fd` is a live socket owned by `stream` and `one` outlives the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_NOSIGPIPE,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub fn disable_sigpipe(_stream: &TcpStream) -> Result<()> {
    Ok(())
}
