pub mod error;
pub mod limiter;
pub mod outcome;
pub mod retry;
pub mod status;
pub mod store;
