//! The integration test harness.
//!
//! - [`IntegrationHarness`] - setup, bounded receive and teardown around one test
//! - [`consume_once`] - receive a single message with a deadline
//! - [`NameGenerator`] - per-harness random route names
//! - [`TeardownReport`] - what cleanup could not do

pub mod consume;
pub mod fixture;
pub mod naming;
pub mod teardown;

pub use consume::consume_once;
pub use fixture::{configure_route, HarnessState, IntegrationHarness, SessionRole};
pub use naming::NameGenerator;
pub use teardown::{CleanupStep, TeardownReport, TeardownWarning};
