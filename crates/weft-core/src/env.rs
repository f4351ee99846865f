//! Environment variable helpers
//!
//! Small typed wrappers over `std::env::var` used for runtime tuning knobs.

/// Read an environment variable as u64, falling back to `default` when
/// unset or unparsable.
pub fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read an environment variable as a boolean. Accepts 1/true/yes/on.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Read an environment variable as a string with a default.
pub fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_defaults() {
        assert_eq!(env_u64("WEFT_TEST_UNSET_U64", 17), 17);
        assert!(!env_bool("WEFT_TEST_UNSET_BOOL", false));
        assert_eq!(env_str("WEFT_TEST_UNSET_STR", "x"), "x");
    }

    #[test]
    fn test_env_parse() {
        std::env::set_var("WEFT_TEST_U64", "64");
        assert_eq!(env_u64("WEFT_TEST_U64", 0), 64);
        std::env::set_var("WEFT_TEST_BOOL", "yes");
        assert!(env_bool("WEFT_TEST_BOOL", false));
    }
}
