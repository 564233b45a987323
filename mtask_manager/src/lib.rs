//! MTASK Manager Library
//!
//! Standalone global component manager and the commands that inspect it.

pub mod commands;
