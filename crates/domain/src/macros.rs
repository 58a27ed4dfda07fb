//! Macro for implementing Display and FromStr for status enums
//!
//! Status enums are stored as lowercase strings (key-value payloads, log
//! fields), so each one needs the same pair of conversions.
//!
//! # Example
//!
//! ```rust
//! use cadence_domain::impl_domain_status_conversions;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq)]
//! pub enum LockState {
//!     Free,
//!     Held,
//! }
//!
//! impl_domain_status_conversions!(LockState {
//!     Free => "free",
//!     Held => "held",
//! });
//!
//! assert_eq!(LockState::Held.to_string(), "held");
//! assert_eq!("FREE".parse::<LockState>(), Ok(LockState::Free));
//! ```

/// Implements Display and case-insensitive FromStr for a fieldless enum
#[macro_export]
macro_rules! impl_domain_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => f.write_str($str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Waiting,
        HalfDone,
    }

    impl_domain_status_conversions!(Phase {
        Waiting => "waiting",
        HalfDone => "half_done",
    });

    #[test]
    fn test_display_and_parse() {
        assert_eq!(Phase::HalfDone.to_string(), "half_done");
        assert_eq!(Phase::from_str("Half_Done"), Ok(Phase::HalfDone));
        assert_eq!(Phase::from_str("WAITING"), Ok(Phase::Waiting));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = Phase::from_str("done").unwrap_err();
        assert!(err.contains("Invalid Phase: done"));
        assert!(Phase::from_str("").is_err());
    }
}
