pub mod backend;
pub mod condense;
pub mod config;
pub mod error;
pub mod layering;
pub mod metric;
pub mod partition;
pub mod pipeline;
pub mod serialize;
pub mod state;
pub mod step;
pub mod stride;
