mod accumulator;
pub mod batcher;
pub mod grouping_key;
