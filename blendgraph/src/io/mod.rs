//! I/O for the pipeline: config, subprocesses, files and collaborators.

pub mod atomic;
pub mod brain;
pub mod checkpoint;
pub mod config;
pub mod docs;
pub mod init;
pub mod process;
pub mod prompt;
pub mod render;
pub mod run_log;
pub mod script;
