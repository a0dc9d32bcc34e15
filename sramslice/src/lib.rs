pub mod allocator;
pub mod bundlizer;
pub mod common;
pub mod config;
pub mod cost;
pub mod datadeps;
pub mod graph;
pub mod memorylimits;
pub mod pipeline;
pub mod pprint;
pub mod scheduler;
pub mod slicing;
pub mod target;
pub mod tiling;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
