//! Per-descriptor metadata registry
//!
//! A process-global cache the hook layer consults before every intercepted
//! call: whether the descriptor is a socket, the user's blocking intent
//! versus the real O_NONBLOCK state, and per-direction timeouts.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// No timeout configured
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Cached state of one descriptor.
///
/// For sockets the hook forces O_NONBLOCK underneath while preserving the
/// user-visible blocking flag, so `sys_nonblock` is true after init and
/// `user_nonblock` tracks only what the user asked for.
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: RawFd) -> FdCtx {
        let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut statbuf) } == -1 {
            (false, false)
        } else {
            (true, (statbuf.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        };

        let sys_nonblock = if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            true
        } else {
            false
        };

        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::Release);
    }

    /// Timeout in ms for `SO_RCVTIMEO` / `SO_SNDTIMEO`; [`NO_TIMEOUT`] when
    /// unset.
    pub fn timeout(&self, kind: libc::c_int) -> u64 {
        match kind {
            libc::SO_RCVTIMEO => self.recv_timeout_ms.load(Ordering::Acquire),
            libc::SO_SNDTIMEO => self.send_timeout_ms.load(Ordering::Acquire),
            _ => NO_TIMEOUT,
        }
    }

    pub fn set_timeout(&self, kind: libc::c_int, ms: u64) {
        match kind {
            libc::SO_RCVTIMEO => self.recv_timeout_ms.store(ms, Ordering::Release),
            libc::SO_SNDTIMEO => self.send_timeout_ms.store(ms, Ordering::Release),
            _ => {}
        }
    }
}

/// Process-global descriptor registry, indexed by fd.
pub struct FdRegistry {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    fn new() -> FdRegistry {
        FdRegistry {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up `fd`, installing a fresh entry when `auto_create`.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            match slots.get(fd as usize) {
                Some(Some(ctx)) => return Some(ctx.clone()),
                Some(None) | None if !auto_create => return None,
                _ => {}
            }
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= fd as usize {
            slots.resize((fd as usize * 3 / 2).max(fd as usize + 1), None);
        }
        let entry = slots[fd as usize]
            .get_or_insert_with(|| Arc::new(FdCtx::new(fd)));
        Some(entry.clone())
    }

    /// Drop the entry for `fd`.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

/// The process-wide registry.
pub fn fd_registry() -> &'static FdRegistry {
    static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
    REGISTRY.get_or_init(FdRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_without_create_is_none() {
        let reg = FdRegistry::new();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert!(reg.get(fds[0], false).is_none());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_pipe_is_not_socket() {
        let reg = FdRegistry::new();
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = reg.get(fds[0], true).unwrap();
        assert!(ctx.is_init());
        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let reg = FdRegistry::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let ctx = reg.get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        reg.del(fd);
        assert!(reg.get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeouts_default_unset() {
        let reg = FdRegistry::new();
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        let ctx = reg.get(fd, true).unwrap();
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), NO_TIMEOUT);
        ctx.set_timeout(libc::SO_RCVTIMEO, 250);
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), 250);
        assert_eq!(ctx.timeout(libc::SO_SNDTIMEO), NO_TIMEOUT);
        unsafe { libc::close(fd) };
    }
}
