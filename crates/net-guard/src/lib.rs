//! # net-guard
//!
//! Loopback enforcement for the core gateway. Every upstream base URL a
//! browser declares goes through [`validate_core_base`] before any network
//! call is made, so the gateway can only ever reach services on this host.
//!
//! ## Usage
//!
//! ```rust
//! use net_guard::{validate_core_base, GuardError};
//!
//! let base = validate_core_base("http://127.0.0.1:20123").unwrap();
//! assert_eq!(base.port(), Some(20123));
//!
//! let err = validate_core_base("http://example.com:1234").unwrap_err();
//! assert_eq!(err.status_code(), 403);
//! assert!(matches!(err, GuardError::NotLoopback { .. }));
//! ```

mod guard;

pub use guard::{is_loopback_host, is_loopback_ip, validate_core_base, GuardError};
