pub mod context;
pub mod error;
pub mod executor;
pub mod for_testing;
pub mod result;
pub mod retry;
pub mod session;
