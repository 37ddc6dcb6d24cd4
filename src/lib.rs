//! Netquota - per-network rate limiting for protected objects
//!
//! This crate implements an in-process rate limiting engine. Each protected
//! object (an API, a channel, a security definition...) carries an ordered
//! list of `<network> = <rate>/<unit>` rules. Requests are counted per matched
//! network in minute, hour or day periods, and objects may delegate to a parent
//! object that must admit the request as well.
//!
//! Counters are kept per process; several processes sharing a quota each
//! enforce it on their own.

pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{LimitExceeded, NetquotaError, Rejection, Result};
pub use ratelimit::{Admission, ObjectInfo, ObjectType, Registry};
