//! V1 API module.
//!
//! Schedule management and invocation submission/polling.

pub mod routes;

pub use routes::{v1_router, V1_PREFIX};
