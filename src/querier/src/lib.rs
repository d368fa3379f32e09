pub mod endpoints;
pub mod metrics;
pub mod query;
pub mod snapshot;
pub mod summary;

pub use endpoints::{QuerierState, router};
