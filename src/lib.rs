pub mod cli;
pub mod error;

pub use error::{CliError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
