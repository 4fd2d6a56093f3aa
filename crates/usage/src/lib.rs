//! Usage metering
//!
//! Prices token consumption per model, persists one `UsageRecord` per request
//! through the store, and serves cached per-owner aggregates. Writes from the
//! request path go through `UsageWriter`, a bounded queue drained by a
//! background worker, so responses never wait on persistence.

mod error;
pub mod meter;
pub mod pricing;
pub mod writer;

pub use error::{Error, Result};
pub use meter::{BATCH_SIZE, UsageMeter};
pub use pricing::{ModelPricing, PricingEntry, PricingTable, TokenUsage};
pub use writer::{UsageWriter, WriterConfig};
