pub mod clusterer;
pub mod error;
pub mod planner;
pub mod ring;
pub mod splitter;
