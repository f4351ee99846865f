//! Minimal TCP wrappers over the hooked facade
//!
//! `Listener` and `Stream` give fiber code a straight-line blocking API:
//! accept/read/write suspend only the calling fiber. Intended for use from
//! fibers running on an [`IoManager`](crate::io::IoManager); descriptors
//! are seeded into the fd registry at creation.

use std::os::unix::io::RawFd;

use weft_core::{WeftError, WeftResult};

use crate::fdreg::fd_registry;
use crate::hook;

fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn new_tcp_socket() -> WeftResult<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(WeftError::Sys("socket", errno()));
    }
    fd_registry().get(fd, true);
    Ok(fd)
}

fn set_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int) {
    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &one as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

fn sockaddr_in(ip: [u8; 4], port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from_be_bytes(ip).to_be();
    addr
}

/// A TCP listener whose `accept` suspends the calling fiber.
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    /// Bind INADDR_ANY:`port` and listen.
    pub fn bind(port: u16) -> WeftResult<Listener> {
        let fd = new_tcp_socket()?;
        set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR);

        let addr = sockaddr_in([0, 0, 0, 0], port);
        let rt = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rt != 0 {
            let e = errno();
            hook::close(fd);
            return Err(WeftError::Sys("bind", e));
        }

        if unsafe { libc::listen(fd, 4096) } != 0 {
            let e = errno();
            hook::close(fd);
            return Err(WeftError::Sys("listen", e));
        }

        Ok(Listener { fd })
    }

    /// Accept a connection, suspending the calling fiber until one arrives.
    pub fn accept(&self) -> WeftResult<Stream> {
        let client =
            unsafe { hook::accept(self.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if client < 0 {
            return Err(WeftError::Sys("accept", errno()));
        }
        set_opt(client, libc::IPPROTO_TCP, libc::TCP_NODELAY);
        Ok(Stream { fd: client })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A TCP connection whose reads and writes suspend the calling fiber.
pub struct Stream {
    fd: RawFd,
}

impl Stream {
    /// Connect to `ip:port`, suspending the calling fiber; `timeout_ms` of
    /// `u64::MAX` means no limit.
    pub fn connect(ip: [u8; 4], port: u16, timeout_ms: u64) -> WeftResult<Stream> {
        let fd = new_tcp_socket()?;
        let addr = sockaddr_in(ip, port);
        let rt = unsafe {
            hook::connect_with_timeout(
                fd,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                timeout_ms,
            )
        };
        if rt != 0 {
            let e = errno();
            hook::close(fd);
            return Err(WeftError::Sys("connect", e));
        }
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY);
        Ok(Stream { fd })
    }

    pub fn from_fd(fd: RawFd) -> Stream {
        fd_registry().get(fd, true);
        Stream { fd }
    }

    /// Read into `buf`. Returns bytes read, 0 at EOF, or -1 with errno set.
    pub fn read(&self, buf: &mut [u8]) -> isize {
        hook::read(self.fd, buf)
    }

    /// Single write. Returns bytes written or -1 with errno set.
    pub fn write(&self, buf: &[u8]) -> isize {
        hook::write(self.fd, buf)
    }

    /// Write the whole buffer. Returns `buf.len()` or -1 with errno set.
    pub fn write_all(&self, buf: &[u8]) -> isize {
        let mut sent = 0;
        while sent < buf.len() {
            let n = hook::write(self.fd, &buf[sent..]);
            if n <= 0 {
                return -1;
            }
            sent += n as usize;
        }
        sent as isize
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}
