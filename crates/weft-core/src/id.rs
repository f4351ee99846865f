//! Fiber identifier type

use core::fmt;

/// Unique identifier for a fiber.
///
/// Ids are handed out from a process-wide monotonically increasing counter.
/// The maximum value (u64::MAX) is reserved as a sentinel for "no fiber",
/// which is what [`FiberId::NONE`] and `Fiber::current_id()` report on a
/// thread that has never entered fiber context.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(u64::MAX);

    /// Create a new FiberId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    /// Check if this is a valid fiber id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u64::MAX
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_basics() {
        let id = FiberId::new(7);
        assert_eq!(id.as_u64(), 7);
        assert!(id.is_some());
        assert!(!id.is_none());
    }

    #[test]
    fn test_fiber_id_none() {
        let none = FiberId::NONE;
        assert!(none.is_none());
        assert_eq!(format!("{}", none), "none");
        assert_eq!(FiberId::default(), FiberId::NONE);
    }

    #[test]
    fn test_fiber_id_conversions() {
        let id: FiberId = 42u64.into();
        let raw: u64 = id.into();
        assert_eq!(raw, 42);
    }
}
