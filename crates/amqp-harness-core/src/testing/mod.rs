//! Test utilities for the AMQP integration harness.
//!
//! - [`InMemoryBroker`] - an in-process broker implementing [`Connector`](crate::broker::Connector)
//! - [`BrokerCall`] / [`BrokerOperation`] - the broker's call log
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use amqp_harness_core::testing::InMemoryBroker;
//! use amqp_harness_core::{HarnessConfig, IntegrationHarness};
//!
//! #[tokio::test]
//! async fn test_round_trip() {
//!     let broker = InMemoryBroker::new();
//!     let mut harness = IntegrationHarness::new(HarnessConfig::default(), Arc::new(broker.clone()));
//!     harness.setup().await.unwrap();
//!     // ...
//!     let report = harness.teardown().await;
//!     assert!(report.is_clean());
//! }
//! ```

pub mod memory_broker;

pub use memory_broker::{BrokerCall, BrokerOperation, InMemoryBroker, MemorySession};
