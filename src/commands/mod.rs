// Transport-facing operations

pub mod interceptor;
pub mod metrics;
pub mod query;
