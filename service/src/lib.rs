//! Infrastructure shared by every binary in the workspace: command line and
//! environment configuration, and console logging.

pub mod config;
pub mod logging;
