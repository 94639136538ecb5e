//! Small helpers shared by the client and the binaries.

pub mod redact;

pub use redact::redact_url;
