//! AMQP Integration Harness Core Library
//!
//! Test-support infrastructure for integration tests against an AMQP 0-9-1
//! broker. A harness opens a driver session and an application session,
//! provisions two uniquely named one-to-one routes ("inbound" and
//! "outbound"), offers a bounded single-message receive, and removes
//! everything again after the test.
//!
//! # Architecture
//!
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Domain-specific error types
//! - [`broker`] - Session traits, message types and the `lapin` backend
//! - [`harness`] - Setup, bounded receive and teardown
//! - `testing` - In-memory broker (feature `testing`)
//!
//! # Example
//!
//! ```rust,ignore
//! use amqp_harness_core::{HarnessConfig, IntegrationHarness, OutboundMessage, SessionRole};
//!
//! let mut harness = IntegrationHarness::amqp(HarnessConfig::default());
//! harness.setup().await?;
//! let inbound = harness.inbound().unwrap_or_default().to_string();
//! harness
//!     .publish(SessionRole::Driver, &inbound, &OutboundMessage::new("ping"))
//!     .await?;
//! let delivery = harness.receive(SessionRole::Application, &inbound).await?;
//! let report = harness.teardown().await;
//! ```

#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod error;
pub mod harness;

/// Test utilities.
///
/// This module is only available when compiling tests or when the `testing` feature is enabled.
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use broker::{
    AmqpConnector, BrokerSession, Connector, DeclareOptions, Delivery, ExchangeKind,
    OutboundMessage, Subscription,
};
pub use config::{BrokerConfig, HarnessConfig, LoggingConfig, RoutingConfig};
pub use error::{BrokerError, ConfigError, HarnessError, Result};
pub use harness::{
    consume_once, HarnessState, IntegrationHarness, NameGenerator, SessionRole, TeardownReport,
};
