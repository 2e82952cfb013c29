pub mod common;
pub mod completions;
pub mod config;
pub mod entities;
pub mod sync;
