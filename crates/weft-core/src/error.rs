//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type WeftResult<T> = Result<T, WeftError>;

/// Errors that can occur in runtime operations.
///
/// Precondition violations (resuming a non-READY fiber, resetting a live
/// fiber) are caller bugs and abort via assertion instead of surfacing here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeftError {
    /// The (fd, direction) pair already has an armed event
    EventExists(i32),

    /// No event armed for this (fd, direction) pair
    NoSuchEvent(i32),

    /// Descriptor outside the tracked range
    NoSuchFd(i32),

    /// Stack allocation or protection failed
    StackAlloc(i32),

    /// A steady-state system call failed (operation name, errno)
    Sys(&'static str, i32),
}

impl fmt::Display for WeftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeftError::EventExists(fd) => write!(f, "event already armed on fd {}", fd),
            WeftError::NoSuchEvent(fd) => write!(f, "no such event on fd {}", fd),
            WeftError::NoSuchFd(fd) => write!(f, "fd {} is not tracked", fd),
            WeftError::StackAlloc(errno) => write!(f, "stack allocation failed: errno {}", errno),
            WeftError::Sys(op, errno) => write!(f, "{} failed: errno {}", op, errno),
        }
    }
}

impl std::error::Error for WeftError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = WeftError::EventExists(5);
        assert_eq!(format!("{}", e), "event already armed on fd 5");

        let e = WeftError::Sys("epoll_ctl", 22);
        assert_eq!(format!("{}", e), "epoll_ctl failed: errno 22");
    }

    #[test]
    fn test_error_is_std_error() {
        fn takes_err(_e: &dyn std::error::Error) {}
        takes_err(&WeftError::NoSuchFd(3));
    }
}
