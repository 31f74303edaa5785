//! Workspace file gateway
//!
//! Path-validated file operations executed inside a user's container, plus
//! the default-workspace bootstrap.

mod gateway;
mod path;

pub use gateway::{FileEntry, FileGateway, ProjectScope, StatInfo};
pub use path::{join_validated, strip_host_prefix, validate_relative};
