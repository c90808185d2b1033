//! Per-test broker fixture.
//!
//! [`IntegrationHarness`] opens a driver session and an application
//! session and provisions an inbound and an outbound route under fresh
//! random names. [`teardown`](IntegrationHarness::teardown) removes them again.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::broker::{AmqpConnector, BrokerSession, Connector, Delivery, OutboundMessage};
use crate::config::{HarnessConfig, RoutingConfig};
use crate::error::{BrokerResult, HarnessError, Result};

use super::consume::consume_once;
use super::naming::NameGenerator;
use super::teardown::{CleanupStep, TeardownReport, TeardownWarning};

/// Lifecycle of a harness. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Unconfigured,
    Ready,
    TornDown,
}

impl HarnessState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Ready => "ready",
            Self::TornDown => "torn down",
        }
    }
}

/// Which of the two harness sessions to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Test-side session that provisions and cleans up routes.
    Driver,
    /// Session standing in for the system under test.
    Application,
}

impl SessionRole {
    /// Label the session is opened with.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Driver => "driver",
            Self::Application => "application",
        }
    }
}

/// Declare a one-to-one route: an exchange and a queue sharing `name`, bound
/// with the empty routing key.
///
/// # Errors
///
/// Returns the first broker error; earlier declarations are left in place.
pub async fn configure_route(
    session: &dyn BrokerSession,
    name: &str,
    routing: &RoutingConfig,
) -> BrokerResult<()> {
    let options = routing.declare_options();
    session
        .declare_exchange(name, routing.exchange_kind, options)
        .await?;
    session.declare_queue(name, options).await?;
    // Fanout exchanges ignore the routing key.
    session.bind_queue(name, name, "").await?;
    debug!(route = name, kind = routing.exchange_kind.as_str(), "route declared");
    Ok(())
}

/// Integration test fixture against one broker.
///
/// Call [`setup`](Self::setup) before the test body and
/// [`teardown`](Self::teardown) after it, or use [`run`](Self::run) which
/// guarantees the teardown.
pub struct IntegrationHarness {
    config: HarnessConfig,
    connector: Arc<dyn Connector>,
    names: NameGenerator,
    state: HarnessState,
    driver: Option<Box<dyn BrokerSession>>,
    application: Option<Box<dyn BrokerSession>>,
    inbound: Option<String>,
    outbound: Option<String>,
    /// Every route name handed out, in provisioning order.
    routes: Vec<String>,
}

impl IntegrationHarness {
    /// Create an unconfigured harness with an entropy-seeded name generator.
    #[must_use]
    pub fn new(config: HarnessConfig, connector: Arc<dyn Connector>) -> Self {
        Self::with_names(config, connector, NameGenerator::from_entropy())
    }

    /// Create an unconfigured harness with the given name generator.
    #[must_use]
    pub fn with_names(
        config: HarnessConfig,
        connector: Arc<dyn Connector>,
        names: NameGenerator,
    ) -> Self {
        Self {
            config,
            connector,
            names,
            state: HarnessState::Unconfigured,
            driver: None,
            application: None,
            inbound: None,
            outbound: None,
            routes: Vec::new(),
        }
    }

    /// Create a harness against the real broker described by `config`.
    #[must_use]
    pub fn amqp(config: HarnessConfig) -> Self {
        let connector = Arc::new(AmqpConnector::new(config.broker.clone()));
        Self::new(config, connector)
    }

    #[must_use]
    pub fn state(&self) -> HarnessState {
        self.state
    }

    /// Name of the inbound route, once provisioned.
    #[must_use]
    pub fn inbound(&self) -> Option<&str> {
        self.inbound.as_deref()
    }

    /// Name of the outbound route, once provisioned.
    #[must_use]
    pub fn outbound(&self) -> Option<&str> {
        self.outbound.as_deref()
    }

    /// Routes that teardown will delete.
    #[must_use]
    pub fn registered_routes(&self) -> &[String] {
        &self.routes
    }

    /// Generate a fresh `<prefix>-<hex>` name from this harness's generator.
    pub fn randomise(&mut self, prefix: &str) -> String {
        self.names.randomise(prefix)
    }

    /// Open both sessions and provision the inbound and outbound routes.
    ///
    /// Performs no cleanup on failure; [`teardown`](Self::teardown) removes
    /// whatever was created.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] unless the harness is
    /// unconfigured, or the first broker error encountered.
    pub async fn setup(&mut self) -> Result<()> {
        self.expect_state(HarnessState::Unconfigured)?;
        info!(
            broker = %self.config.broker.display_target(),
            "setting up integration harness"
        );

        let driver = self.connector.connect(SessionRole::Driver.label()).await?;
        self.driver = Some(driver);

        let prefix = self.config.routing.inbound_prefix.clone();
        self.inbound = Some(self.declare_route(&prefix).await?);

        let prefix = self.config.routing.outbound_prefix.clone();
        self.outbound = Some(self.declare_route(&prefix).await?);

        let application = self
            .connector
            .connect(SessionRole::Application.label())
            .await?;
        self.application = Some(application);

        self.state = HarnessState::Ready;
        info!(
            inbound = self.inbound().unwrap_or_default(),
            outbound = self.outbound().unwrap_or_default(),
            "integration harness ready"
        );
        Ok(())
    }

    /// Provision an extra route on the driver session. It is deleted on
    /// teardown like the standard two.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] unless the harness is ready,
    /// or the broker error from declaring the route.
    pub async fn provision_route(&mut self, prefix: &str) -> Result<String> {
        self.expect_state(HarnessState::Ready)?;
        self.declare_route(prefix).await
    }

    async fn declare_route(&mut self, prefix: &str) -> Result<String> {
        let name = self.names.randomise(prefix);
        // Registered before declaring so a half-declared route is still removed.
        self.routes.push(name.clone());

        let driver = self.session(SessionRole::Driver)?;
        configure_route(driver, &name, &self.config.routing).await?;
        Ok(name)
    }

    /// One of the two sessions.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] if the session was never opened
    /// or teardown already released it.
    pub fn session(&self, role: SessionRole) -> Result<&dyn BrokerSession> {
        let slot = match role {
            SessionRole::Driver => &self.driver,
            SessionRole::Application => &self.application,
        };
        slot.as_deref().ok_or(HarnessError::InvalidState {
            state: self.state.as_str(),
            expected: "ready",
        })
    }

    /// The driver session.
    ///
    /// # Errors
    ///
    /// See [`session`](Self::session).
    pub fn driver(&self) -> Result<&dyn BrokerSession> {
        self.session(SessionRole::Driver)
    }

    /// The application session.
    ///
    /// # Errors
    ///
    /// See [`session`](Self::session).
    pub fn application(&self) -> Result<&dyn BrokerSession> {
        self.session(SessionRole::Application)
    }

    /// Publish `message` to `exchange` with the empty routing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unavailable or the publish fails.
    pub async fn publish(
        &self,
        role: SessionRole,
        exchange: &str,
        message: &OutboundMessage,
    ) -> Result<()> {
        self.session(role)?.publish(exchange, "", message).await?;
        Ok(())
    }

    /// Receive one message from `queue` on the given session.
    ///
    /// # Errors
    ///
    /// See [`consume_once`].
    pub async fn consume_once(
        &self,
        role: SessionRole,
        queue: &str,
        timeout: Duration,
    ) -> Result<Delivery> {
        consume_once(self.session(role)?, queue, timeout).await
    }

    /// [`consume_once`](Self::consume_once) with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`consume_once`].
    pub async fn receive(&self, role: SessionRole, queue: &str) -> Result<Delivery> {
        self.consume_once(role, queue, self.config.receive.timeout())
            .await
    }

    /// Close one session ahead of teardown, if it is open.
    ///
    /// Returns a warning instead of failing.
    pub async fn close_session(&self, role: SessionRole) -> Option<TeardownWarning> {
        let session = self.session(role).ok()?;
        let mut report = TeardownReport::default();
        close_quietly(session, &mut report).await;
        report.warnings().first().cloned()
    }

    /// Delete every registered route, then close both sessions.
    ///
    /// Never fails: every step is attempted and failures are logged and
    /// returned in the report. Calling it again is a no-op.
    pub async fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let routes = std::mem::take(&mut self.routes);

        match self.driver.as_deref() {
            Some(driver) => {
                for route in &routes {
                    delete_route(driver, route, &mut report).await;
                }
            }
            None if !routes.is_empty() => {
                warn!(count = routes.len(), "no driver session, routes not deleted");
            }
            None => {}
        }
        self.inbound = None;
        self.outbound = None;

        for session in [self.driver.take(), self.application.take()]
            .into_iter()
            .flatten()
        {
            close_quietly(session.as_ref(), &mut report).await;
        }

        if self.state != HarnessState::TornDown {
            info!(
                deleted = report.deleted_routes().len(),
                warnings = report.warnings().len(),
                "integration harness torn down"
            );
        }
        self.state = HarnessState::TornDown;
        report
    }

    /// Run `body` between setup and teardown.
    ///
    /// Teardown always runs, even after a failed setup or a panicking body.
    /// A panic is resumed once teardown has finished.
    ///
    /// ```rust,ignore
    /// let (result, report) = harness
    ///     .run(|h| Box::pin(async move {
    ///         let inbound = h.inbound().unwrap_or_default().to_string();
    ///         h.publish(SessionRole::Application, &inbound, &OutboundMessage::new("hi")).await?;
    ///         h.receive(SessionRole::Driver, &inbound).await
    ///     }))
    ///     .await;
    /// ```
    pub async fn run<T, F>(mut self, body: F) -> (Result<T>, TeardownReport)
    where
        F: for<'h> FnOnce(&'h mut IntegrationHarness) -> BoxFuture<'h, Result<T>>,
    {
        let outcome = match self.setup().await {
            Ok(()) => AssertUnwindSafe(body(&mut self)).catch_unwind().await,
            Err(e) => Ok(Err(e)),
        };

        let report = self.teardown().await;
        match outcome {
            Ok(result) => (result, report),
            Err(panic) => {
                warn!("test body panicked, resuming after teardown");
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn expect_state(&self, expected: HarnessState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HarnessError::InvalidState {
                state: self.state.as_str(),
                expected: expected.as_str(),
            })
        }
    }
}

impl Drop for IntegrationHarness {
    fn drop(&mut self) {
        if !self.routes.is_empty() {
            warn!(
                routes = ?self.routes,
                "integration harness dropped without teardown, routes left on broker"
            );
        }
    }
}

async fn delete_route(driver: &dyn BrokerSession, name: &str, report: &mut TeardownReport) {
    let mut clean = true;

    match driver.delete_queue(name).await {
        Ok(purged) => debug!(queue = name, purged, "queue deleted"),
        Err(e) => {
            report.warn(CleanupStep::DeleteQueue, name, &e);
            clean = false;
        }
    }
    // Each route owns an exchange of the same name.
    match driver.delete_exchange(name).await {
        Ok(()) => debug!(exchange = name, "exchange deleted"),
        Err(e) => {
            report.warn(CleanupStep::DeleteExchange, name, &e);
            clean = false;
        }
    }

    if clean {
        report.route_deleted(name);
    }
}

async fn close_quietly(session: &dyn BrokerSession, report: &mut TeardownReport) {
    if !session.is_open() {
        debug!(session = session.label(), "session already closed");
        return;
    }
    match session.close().await {
        Ok(()) => report.session_closed(session.label()),
        Err(e) => report.warn(CleanupStep::CloseSession, session.label(), &e),
    }
}
