pub mod cancellation;
pub mod config;
pub mod engine;
pub mod filter;
pub mod grouping;
pub mod models;
pub mod targets;
pub mod test_utils;
pub mod traits;
mod utils;
