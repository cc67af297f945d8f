//! Outer supervisor
//!
//! Owns everything that spans modem sessions: opening the serial port,
//! deciding whether the next session starts with a full modem reset, pacing
//! retries, and keeping the alert channel informed. Sessions run strictly one
//! at a time against the device.

use std::time::Duration;

use smsgate_modem::{
    open_serial, reset_modem, run_diagnostics, AtTransport, DiagnosticError, FailureKind,
};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::notifier::FailureNotifier;
use crate::session::{run_polling_loop, SessionState};
use crate::telegram::MessageSink;

/// Delay between modem sessions after a failure.
const SESSION_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Default per-command timeout on the modem link.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// SIM-level problems and denied registration are the verdicts a power-cycle
/// of the modem's functionality can actually cure.
fn warrants_reset(kind: FailureKind) -> bool {
    matches!(
        kind,
        FailureKind::SimNotDetected
            | FailureKind::SimPinRequired
            | FailureKind::SimPukLocked
            | FailureKind::NetworkDenied
    )
}

/// Run sessions until shutdown. Diagnostic verdicts end a session, get
/// announced, and feed the reset decision for the next attempt; nothing here
/// is fatal to the process.
pub async fn run(config: &Config, sink: &dyn MessageSink, cancel: &CancellationToken) {
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let mut notifier = FailureNotifier::new(config.chat_ids.clone(), config.dry_run, hostname);
    let mut need_reset = false;

    while !cancel.is_cancelled() {
        match run_session(config, sink, &mut notifier, need_reset, cancel).await {
            Ok(()) => return,
            Err(verdict) => {
                error!(kind = %verdict.kind(), error = %verdict, "modem session ended");
                notifier.notify_failure(sink, &verdict).await;

                need_reset = warrants_reset(verdict.kind());
                if need_reset {
                    info!("will perform a full modem reset on the next attempt");
                }

                info!(retry_in = ?SESSION_RETRY_DELAY, "will retry modem session");
                if cancel.run_until_cancelled(sleep(SESSION_RETRY_DELAY)).await.is_none() {
                    return;
                }
            }
        }
    }
}

/// One modem session: open, optionally reset, diagnose, then poll.
async fn run_session(
    config: &Config,
    sink: &dyn MessageSink,
    notifier: &mut FailureNotifier,
    need_reset: bool,
    cancel: &CancellationToken,
) -> Result<(), DiagnosticError> {
    info!(port = %config.serial_port, baud = config.baud_rate, "opening serial port");
    let port = open_serial(&config.serial_port, config.baud_rate).map_err(|err| {
        DiagnosticError::SerialPortUnavailable(format!(
            "failed to open {}: {err}",
            config.serial_port
        ))
    })?;
    info!("serial port opened");

    let mut at = AtTransport::new(port, COMMAND_TIMEOUT);

    if need_reset {
        reset_modem(&mut at, cancel).await;
        if cancel.is_cancelled() {
            return Ok(());
        }
    }

    let mut state = SessionState::new(Instant::now());

    info!("running modem diagnostics");
    run_diagnostics(&mut at, state.started_at, config.network_reg_grace(), cancel).await?;
    if cancel.is_cancelled() {
        return Ok(());
    }

    // The modem came up healthy; clear any announced failure.
    notifier.notify_recovery(sink).await;

    // PDU mode and SIM storage selection are best-effort; a modem that
    // rejects them will fail loudly at the first poll instead.
    if let Err(err) = at.command("AT+CMGF=0").await {
        warn!(error = %err, "failed to set PDU mode");
    }
    if let Err(err) = at.command("AT+CPMS=\"SM\",\"SM\",\"SM\"").await {
        warn!(error = %err, "failed to set message storage");
    }

    run_polling_loop(&mut at, &mut state, sink, config, cancel).await
}
