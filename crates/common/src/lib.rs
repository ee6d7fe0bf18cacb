pub mod config;
pub mod error;
pub mod halt;
pub mod types;
