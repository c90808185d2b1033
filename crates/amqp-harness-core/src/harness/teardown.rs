//! Teardown outcome reporting.
//!
//! Teardown never fails. Whatever went wrong is collected here and logged,
//! so a test can assert on cleanup health without cleanup masking the
//! test's own result.

use std::fmt;

use tracing::warn;

/// A cleanup action attempted during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStep {
    DeleteQueue,
    DeleteExchange,
    CloseSession,
}

impl fmt::Display for CleanupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeleteQueue => f.write_str("delete queue"),
            Self::DeleteExchange => f.write_str("delete exchange"),
            Self::CloseSession => f.write_str("close session"),
        }
    }
}

/// A cleanup action that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownWarning {
    pub step: CleanupStep,
    /// Route name or session label.
    pub resource: String,
    pub message: String,
}

impl fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.step, self.resource, self.message)
    }
}

/// Outcome of [`IntegrationHarness::teardown`](super::IntegrationHarness::teardown).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    warnings: Vec<TeardownWarning>,
    deleted_routes: Vec<String>,
    closed_sessions: Vec<String>,
}

impl TeardownReport {
    /// True when every cleanup action succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    #[must_use]
    pub fn warnings(&self) -> &[TeardownWarning] {
        &self.warnings
    }

    /// Warnings about one route or session.
    pub fn warnings_for<'a>(&'a self, resource: &'a str) -> impl Iterator<Item = &'a TeardownWarning> {
        self.warnings.iter().filter(move |w| w.resource == resource)
    }

    /// Routes whose queue and exchange were both deleted.
    #[must_use]
    pub fn deleted_routes(&self) -> &[String] {
        &self.deleted_routes
    }

    /// Sessions that were open and have been closed.
    #[must_use]
    pub fn closed_sessions(&self) -> &[String] {
        &self.closed_sessions
    }

    pub(crate) fn warn(&mut self, step: CleanupStep, resource: &str, error: &dyn fmt::Display) {
        let warning = TeardownWarning {
            step,
            resource: resource.to_string(),
            message: error.to_string(),
        };
        warn!(step = %step, resource, error = %warning.message, "teardown step failed");
        self.warnings.push(warning);
    }

    pub(crate) fn route_deleted(&mut self, name: &str) {
        self.deleted_routes.push(name.to_string());
    }

    pub(crate) fn session_closed(&mut self, label: &str) {
        self.closed_sessions.push(label.to_string());
    }
}
