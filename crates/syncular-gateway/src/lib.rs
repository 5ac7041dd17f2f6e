//! Console federation gateway: a stateless reverse aggregator that fans
//! console reads out to N sync instances, merges the pages, and proxies
//! single-instance control operations.

pub mod fetch;
pub mod instances;
pub mod live;
pub mod merge;
pub mod routes;
pub mod state;
