//! Small standalone helpers.
//!
//! - [`email`]: envelope address sanity checks used before MAIL FROM/RCPT TO
//!   are accepted into a session.

pub mod email;

pub use email::validate_email;
