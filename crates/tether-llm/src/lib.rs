//! # tether-llm
//!
//! The model seam of the Tether runtime: `Model` and `ModelProvider` traits,
//! request/response types, a TTL-cached provider pool with logical tier
//! mapping, and a deterministic mock for tests. Concrete HTTP providers live
//! outside the kernel.

pub mod mock;
pub mod pool;
pub mod provider;

pub use mock::{MockModel, MockModelProvider, MockResponse};
pub use pool::ProviderPool;
pub use provider::{
    Model, ModelProvider, ModelRequest, ModelResponse, StopReason, StreamChunk, Usage,
};
