//! JSON control API processing
//!
//! Two verb sets share the same pipeline: the core API clients speak
//! ([`handler`]) and the admin/monitor API ([`admin`]).

pub(crate) mod admin;
pub(crate) mod handler;
