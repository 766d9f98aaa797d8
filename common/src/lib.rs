pub mod config;
pub mod endpoint;
pub mod error;
pub mod for_testing;
pub mod statement;
pub mod token;
pub mod token_range;
pub mod topology;
