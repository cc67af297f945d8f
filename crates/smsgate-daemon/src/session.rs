//! Modem session: timer loop and failure routing
//!
//! A session is one stretch of polling against an opened modem link. Three
//! things drive it: an immediate first pass, the poll interval, and a slower
//! health check. No two timer actions overlap — each runs to completion,
//! nested diagnostics included, before the next event is serviced.
//!
//! Session state is an explicit struct so the failure-routing transitions are
//! testable without a device: timeouts accumulate toward escalation, device
//! errors escalate to diagnostics immediately, delivery errors never end the
//! session.

use smsgate_core::MultipartCollector;
use smsgate_modem::{run_diagnostics, AtTransport, DiagnosticError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::pipeline::{process_messages, CycleError};
use crate::telegram::MessageSink;

/// Consecutive timeout-kind failures tolerated before the session ends.
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

/// What to do about a failed poll cycle.
#[derive(Debug, PartialEq, Eq)]
pub enum FailureAction {
    /// Transient; keep polling.
    Continue,
    /// The modem answered with an error; diagnostics will say why.
    RunDiagnostics,
    /// The modem has stopped talking; end the session with this verdict.
    Escalate(DiagnosticError),
}

/// Mutable state of one modem session.
#[derive(Debug)]
pub struct SessionState {
    /// Anchors the network-registration grace window.
    pub started_at: Instant,
    consecutive_timeouts: u32,
}

impl SessionState {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            consecutive_timeouts: 0,
        }
    }

    /// A cycle completed without a modem failure.
    pub fn record_success(&mut self) {
        self.consecutive_timeouts = 0;
    }

    /// Route a cycle failure into the next control-flow step.
    pub fn route_failure(&mut self, error: &CycleError) -> FailureAction {
        match error {
            CycleError::Cancelled => FailureAction::Continue,
            CycleError::Modem(at_err) if at_err.is_timeout() => {
                self.consecutive_timeouts += 1;
                warn!(
                    consecutive = self.consecutive_timeouts,
                    max = MAX_CONSECUTIVE_TIMEOUTS,
                    "modem timeout"
                );
                if self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    FailureAction::Escalate(DiagnosticError::ModemNotResponding(format!(
                        "modem not responding after {} attempts: {at_err}",
                        self.consecutive_timeouts
                    )))
                } else {
                    FailureAction::Continue
                }
            }
            CycleError::Modem(at_err) if at_err.is_device_error() => {
                warn!("modem returned an error, running diagnostics to find the cause");
                FailureAction::RunDiagnostics
            }
            // Write failures and delivery failures are not the modem going
            // quiet; the next tick gets another chance.
            CycleError::Modem(_) | CycleError::Delivery(_) => FailureAction::Continue,
        }
    }
}

// ----------------------------------------------------------------------------
// Polling Loop
// ----------------------------------------------------------------------------

/// Poll until shutdown (`Ok`) or a terminal diagnostic verdict (`Err`).
pub async fn run_polling_loop<P>(
    at: &mut AtTransport<P>,
    state: &mut SessionState,
    sink: &dyn MessageSink,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<(), DiagnosticError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut collector = MultipartCollector::new();

    info!(
        poll_interval = ?config.poll_interval(),
        health_check_interval = ?config.health_check_interval(),
        "starting SMS polling loop"
    );

    // Immediate first pass, then the steady cadence.
    if let Some(verdict) = run_cycle(at, &mut collector, state, sink, config, cancel).await {
        return Err(verdict);
    }

    let mut poll = interval_at(Instant::now() + config.poll_interval(), config.poll_interval());
    let mut health = interval_at(
        Instant::now() + config.health_check_interval(),
        config.health_check_interval(),
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, leaving polling loop");
                return Ok(());
            }
            _ = health.tick() => {
                if let Some(verdict) = run_health_check(at, state, config, cancel).await {
                    return Err(verdict);
                }
            }
            _ = poll.tick() => {
                if let Some(verdict) =
                    run_cycle(at, &mut collector, state, sink, config, cancel).await
                {
                    return Err(verdict);
                }
            }
        }
    }
}

/// One poll cycle plus failure routing. `Some` ends the session.
async fn run_cycle<P>(
    at: &mut AtTransport<P>,
    collector: &mut MultipartCollector,
    state: &mut SessionState,
    sink: &dyn MessageSink,
    config: &Config,
    cancel: &CancellationToken,
) -> Option<DiagnosticError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let Err(err) = process_messages(at, collector, sink, config, cancel).await else {
        state.record_success();
        return None;
    };
    error!(error = %err, "error processing messages");

    match state.route_failure(&err) {
        FailureAction::Continue => None,
        FailureAction::Escalate(verdict) => Some(verdict),
        FailureAction::RunDiagnostics => {
            match run_diagnostics(at, state.started_at, config.network_reg_grace(), cancel).await {
                Err(verdict) => Some(verdict),
                Ok(()) if cancel.is_cancelled() => None,
                // Diagnostics came back clean yet the command failed; treat
                // the modem as unusable for this session.
                Ok(()) => Some(DiagnosticError::ModemNotResponding(format!(
                    "modem command failed: {err}"
                ))),
            }
        }
    }
}

/// Liveness ping, escalating to diagnostics on a device error.
async fn run_health_check<P>(
    at: &mut AtTransport<P>,
    state: &mut SessionState,
    config: &Config,
    cancel: &CancellationToken,
) -> Option<DiagnosticError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    debug!("running modem health check");
    match at.ping().await {
        Ok(()) => {
            debug!("modem health check passed");
            state.record_success();
            None
        }
        Err(err) if err.is_timeout() => {
            error!(error = %err, "modem health check failed");
            Some(DiagnosticError::ModemNotResponding(format!(
                "health check failed: {err}"
            )))
        }
        Err(err) => {
            warn!(error = %err, "health check returned a device error, running diagnostics");
            match run_diagnostics(at, state.started_at, config.network_reg_grace(), cancel).await {
                Err(verdict) => Some(verdict),
                Ok(()) => {
                    state.record_success();
                    None
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
