//! Command implementations for the CLI.

mod config;
mod devices;
mod set;
mod status;
mod watch;

pub use config::cmd_config;
pub use devices::cmd_devices;
pub use set::{Edit, cmd_set};
pub use status::cmd_status;
pub use watch::cmd_watch;
