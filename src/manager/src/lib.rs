pub mod api;
pub mod collector;
pub mod filestore;
pub mod model;
pub mod sweeper;

pub use api::{ManagerState, router};
