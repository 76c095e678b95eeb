pub mod allocation;
pub mod cluster;
pub mod config;
pub mod error;
pub mod launcher;
pub mod shutdown;
pub mod supervisor;

pub use error::{LaunchError, Result};
pub use launcher::{LaunchRequest, NodeLauncher};
