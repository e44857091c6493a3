//! Command-line surface: argument parsing and the interactive shell.

pub mod cli_struct;
pub mod shell;

pub use cli_struct::MiniFsCli;
pub use shell::Shell;
