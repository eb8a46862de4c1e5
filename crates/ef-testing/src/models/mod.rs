pub mod case;
pub mod error;
pub mod result;
pub mod suite;
