//! Domain logic shared by the srtcast agent and its control layer.
//!
//! Everything in this crate is pure: no I/O, no async, no database. The
//! agent crate wires these helpers to processes and storage.

pub mod command;
pub mod error;
pub mod multicast;
pub mod naming;
pub mod relay_stats;
pub mod srt_url;
pub mod token;
pub mod ts_info;
pub mod types;
