pub mod actions;
pub mod bcb;
pub mod config;
pub mod error;
pub mod identification;
pub mod k_line;
pub mod kwp2000;
pub mod memory;
pub mod operations;
pub mod security;

pub use error::Error;
