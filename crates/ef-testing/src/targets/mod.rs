//! Transports to the systems under test.
pub mod command;
pub mod hive;
pub mod jwt;
pub mod rpc;
pub mod transition;
