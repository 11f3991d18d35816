//! DNS monitor - observes DNS traffic, correlates answers with the
//! processes that asked, and optionally enforces a block list.
//!
//! The library exposes the flow pipeline and its parts for testing and
//! benchmarking; the binary wires them to a UDP interceptor.

pub mod activation;
pub mod cache;
pub mod dns;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod process;
pub mod proxy;
pub mod record;
pub mod stats;
pub mod transport;

pub use error::{Error, Result};
