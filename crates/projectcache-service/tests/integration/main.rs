// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod aggregator;
pub mod invalidation;
pub mod service;
pub mod utils;

pub use utils::*;
