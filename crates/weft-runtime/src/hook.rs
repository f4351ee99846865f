//! Hooked blocking primitives
//!
//! The hooked set is an explicit facade: call these instead of the raw
//! libc symbols. On a worker thread with hooking enabled, a call that would
//! block instead registers readiness interest, yields the calling fiber,
//! and retries once the I/O manager resumes it; the worker thread never
//! blocks in the kernel. Everywhere else the calls fall through to the raw
//! primitive.
//!
//! Per-direction timeouts cached in the [fd registry](crate::fdreg) are
//! honored by arming a condition timer that cancels the pending event and
//! surfaces `-1`/`ETIMEDOUT`.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libc::{c_int, c_ulong, c_void, sockaddr, socklen_t};

use weft_core::kerror;

use crate::fdreg::{fd_registry, NO_TIMEOUT};
use crate::fiber;
use crate::io::{Event, IoManager};
use crate::tls;

/// Engage or disengage hooking for the calling thread. Worker loops enable
/// it on startup.
pub fn set_hook_enable(on: bool) {
    tls::set_hook_enabled(on);
}

/// Is hooking engaged on the calling thread?
pub fn is_hook_enable() -> bool {
    tls::hook_enabled()
}

/// Witness for one suspended call; the condition timer marks it timed out.
#[derive(Default)]
struct IoCall {
    cancelled: AtomicI32,
}

/// The calling fiber, when it can actually be parked. The thread-main fiber
/// yields onto itself, so parking it would block the thread anyway.
fn suspendable_fiber() -> Option<std::sync::Arc<crate::fiber::Fiber>> {
    let fiber = tls::current_fiber()?;
    let main = tls::thread_fiber()?;
    if Arc::ptr_eq(&fiber, &main) {
        return None;
    }
    Some(fiber)
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: i32) {
    unsafe { *libc::__errno_location() = v };
}

/// The generic hooked I/O path: raw call → EINTR retry → on EAGAIN,
/// register interest, yield, and either retry on readiness or return
/// `-1`/`ETIMEDOUT` when the direction's timeout fires first.
fn do_io(
    fd: c_int,
    name: &'static str,
    event: Event,
    timeout_kind: c_int,
    mut raw: impl FnMut() -> isize,
) -> isize {
    if !is_hook_enable() {
        return raw();
    }
    let Some(ctx) = fd_registry().get(fd, false) else {
        return raw();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw();
    }

    let timeout = ctx.timeout(timeout_kind);
    let call = Arc::new(IoCall::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would have blocked. Without a suspendable fiber there is nothing
        // to park; hand the EAGAIN back.
        let Some(iom) = IoManager::current() else {
            return n;
        };
        if suspendable_fiber().is_none() {
            return n;
        }

        let timer = if timeout != NO_TIMEOUT {
            let winfo = Arc::downgrade(&call);
            let iom_t = iom.clone();
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let Some(call) = winfo.upgrade() else { return };
                    if call.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    call.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    iom_t.cancel_event(fd, event);
                },
                Arc::downgrade(&call),
                false,
            ))
        } else {
            None
        };

        match iom.add_event(fd, event) {
            Err(e) => {
                kerror!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
                if let Some(timer) = timer {
                    timer.cancel();
                }
                return -1;
            }
            Ok(()) => {
                fiber::yield_now();
                // resumed: either the event fired or the timer cancelled it
                if let Some(timer) = &timer {
                    timer.cancel();
                }
                if call.cancelled.load(Ordering::Acquire) == libc::ETIMEDOUT {
                    set_errno(libc::ETIMEDOUT);
                    return -1;
                }
            }
        }
    }
}

// ── sleep family ──

/// Cooperative sleep; suspends only the calling fiber.
pub fn sleep(seconds: u32) -> u32 {
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: u64) -> c_int {
    sleep_ms(usec / 1000);
    0
}

/// Cooperative nanosleep, rounded down to milliseconds.
///
/// # Safety
///
/// `req` must point to a valid timespec; `rem` follows the raw `nanosleep`
/// contract (may be null, and is never written since the sleep is not
/// interruptible).
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::nanosleep(req, rem) };
    }
    let req = unsafe { &*req };
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

/// Millisecond sleep. On a hooked worker thread this parks the fiber on a
/// timer; elsewhere it blocks the OS thread.
pub fn sleep_ms(ms: u64) {
    if !is_hook_enable() {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    }
    let Some(iom) = IoManager::current() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };
    let Some(fiber) = suspendable_fiber() else {
        std::thread::sleep(Duration::from_millis(ms));
        return;
    };

    let sched = iom.scheduler();
    iom.add_timer(
        ms,
        move || {
            sched.schedule_fiber(fiber.clone());
        },
        false,
    );
    fiber::yield_now();
}

// ── socket lifecycle ──

/// Create a socket and seed its registry entry.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        kerror!("socket() failed: errno {}", errno());
        return fd;
    }
    fd_registry().get(fd, true);
    fd
}

/// Connect with the process default timeout (none).
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `len`.
pub unsafe fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, len, NO_TIMEOUT)
}

/// Connect, polling WRITE readiness and verifying via `SO_ERROR`.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `len`.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::connect(fd, addr, len) };
    }
    let Some(ctx) = fd_registry().get(fd, false) else {
        return unsafe { libc::connect(fd, addr, len) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, len) };
    }

    let n = unsafe { libc::connect(fd, addr, len) };
    if n == 0 {
        return 0;
    }
    if !(n == -1 && errno() == libc::EINPROGRESS) {
        return n;
    }
    let Some(iom) = IoManager::current() else {
        return n;
    };
    if suspendable_fiber().is_none() {
        return n;
    }

    let call = Arc::new(IoCall::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&call);
        let iom_t = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(call) = winfo.upgrade() else { return };
                if call.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                call.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                iom_t.cancel_event(fd, Event::Write);
            },
            Arc::downgrade(&call),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write) {
        Ok(()) => {
            fiber::yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = call.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(timer) = timer {
                timer.cancel();
            }
            kerror!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // writability alone does not mean success
    let mut err: c_int = 0;
    let mut err_len = std::mem::size_of::<c_int>() as socklen_t;
    let rt = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut c_int as *mut c_void,
            &mut err_len,
        )
    };
    if rt == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// Accept a connection; the new descriptor is seeded into the registry.
///
/// # Safety
///
/// `addr`/`len` follow the raw `accept` contract (both may be null).
pub unsafe fn accept(fd: c_int, addr: *mut sockaddr, len: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", Event::Read, libc::SO_RCVTIMEO, || unsafe {
        libc::accept(fd, addr, len) as isize
    });
    if n >= 0 {
        fd_registry().get(n as c_int, true);
    }
    n as c_int
}

// ── read family ──

pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "read", Event::Read, libc::SO_RCVTIMEO, || unsafe {
        libc::read(fd, ptr as *mut c_void, len)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "readv", Event::Read, libc::SO_RCVTIMEO, || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "recv", Event::Read, libc::SO_RCVTIMEO, || unsafe {
        libc::recv(fd, ptr as *mut c_void, len, flags)
    })
}

/// # Safety
///
/// `src_addr`/`addrlen` follow the raw `recvfrom` contract.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr();
    let len = buf.len();
    do_io(fd, "recvfrom", Event::Read, libc::SO_RCVTIMEO, || unsafe {
        libc::recvfrom(fd, ptr as *mut c_void, len, flags, src_addr, addrlen)
    })
}

// ── write family ──

pub fn write(fd: c_int, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "write", Event::Write, libc::SO_SNDTIMEO, || unsafe {
        libc::write(fd, ptr as *const c_void, len)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> isize {
    do_io(fd, "writev", Event::Write, libc::SO_SNDTIMEO, || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "send", Event::Write, libc::SO_SNDTIMEO, || unsafe {
        libc::send(fd, ptr as *const c_void, len, flags)
    })
}

/// # Safety
///
/// `dest_addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn sendto(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const sockaddr,
    addrlen: socklen_t,
) -> isize {
    let ptr = buf.as_ptr();
    let len = buf.len();
    do_io(fd, "sendto", Event::Write, libc::SO_SNDTIMEO, || unsafe {
        libc::sendto(fd, ptr as *const c_void, len, flags, dest_addr, addrlen)
    })
}

// ── descriptor management ──

/// Close: cancel all pending events on `fd`, drop its registry entry, then
/// close for real.
pub fn close(fd: c_int) -> c_int {
    if !is_hook_enable() {
        return unsafe { libc::close(fd) };
    }
    if let Some(ctx) = fd_registry().get(fd, false) {
        ctx.set_closed();
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_registry().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// fcntl with O_NONBLOCK intent tracking.
///
/// `F_SETFL` records the user's O_NONBLOCK wish but keeps a socket actually
/// non-blocking underneath; `F_GETFL` reports the flags with O_NONBLOCK
/// reflecting the user's setting, not the system one.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let ctx = fd_registry().get(fd, false);
            let Some(ctx) = ctx else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            }
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let arg = if ctx.sys_nonblock() {
                arg | libc::O_NONBLOCK
            } else {
                arg & !libc::O_NONBLOCK
            };
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            let Some(ctx) = fd_registry().get(fd, false) else {
                return flags;
            };
            if ctx.is_closed() || !ctx.is_socket() {
                return flags;
            }
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// ioctl with FIONBIO intent tracking; other requests pass through.
///
/// # Safety
///
/// `arg` must be valid for `request` per the raw `ioctl` contract.
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
        if let Some(ctx) = fd_registry().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    unsafe { libc::ioctl(fd, request as _, arg) }
}

/// Passthrough.
///
/// # Safety
///
/// Raw `getsockopt` contract.
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// setsockopt, mirroring `SO_RCVTIMEO`/`SO_SNDTIMEO` into the registry.
///
/// # Safety
///
/// `optval` must point to `optlen` valid bytes for `optname`.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if is_hook_enable()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_registry().get(fd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            ctx.set_timeout(optname, tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000);
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_passthrough_without_hook() {
        assert!(!is_hook_enable());
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(
            unsafe { libc::write(fds[1], b"hi".as_ptr() as *const c_void, 2) },
            2
        );

        let mut buf = [0u8; 8];
        let n = read(fds[0], &mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_preserves_user_view() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // the registry forced O_NONBLOCK underneath, but the user never
        // asked for it
        let flags = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(flags & libc::O_NONBLOCK, 0);
        let real = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(real & libc::O_NONBLOCK != 0);

        // now the user opts in, and sees it back
        fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        assert!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_setsockopt_caches_timeouts() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rt = unsafe {
            setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const c_void,
                std::mem::size_of::<libc::timeval>() as socklen_t,
            )
        };
        assert_eq!(rt, 0);
        let ctx = fd_registry().get(fd, false).unwrap();
        assert_eq!(ctx.timeout(libc::SO_RCVTIMEO), 1500);

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_sleep_ms_without_manager_blocks_thread() {
        let start = std::time::Instant::now();
        sleep_ms(20);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
