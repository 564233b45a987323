//! Component threads: the per-component loop that runs startup, drains
//! mailboxes, runs periodic or continuous cycles and cleans up.

pub(crate) mod executor;

pub use executor::IDLE_WAIT;
