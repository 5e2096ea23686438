//! Utility modules

pub mod debug;
pub mod exec;
pub mod fs;
pub mod net;

pub use debug::DebugLogger;
pub use exec::{command_exists, get_command_path, resolve_program};
pub use fs::copy_dir_all;
pub use net::available_ports;
