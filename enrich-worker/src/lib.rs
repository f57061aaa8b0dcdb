pub mod config;
pub mod error;
pub mod matcher;
pub mod plate;
pub mod worker;
