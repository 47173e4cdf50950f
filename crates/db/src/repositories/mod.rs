//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument. Conditional state changes are
//! expressed as `UPDATE ... WHERE status = ANY(...) RETURNING`, so a write
//! either applies atomically or reports that the row was not in an
//! eligible state.

pub mod channel_repo;
pub mod command_repo;
pub mod recording_repo;
pub mod server_log_repo;
pub mod server_repo;

pub use channel_repo::ChannelRepo;
pub use command_repo::CommandRepo;
pub use recording_repo::RecordingRepo;
pub use server_log_repo::ServerLogRepo;
pub use server_repo::ServerRepo;
