//! Modem health diagnostics
//!
//! Runs fresh on every invocation: liveness probe, SIM status (with retries
//! for cold SIM init), signal check, then network registration with a bounded
//! grace window. The first structural failure is the verdict; reaching the end
//! means the modem is healthy.
//!
//! The engine only classifies. Whether a verdict warrants a modem reset is the
//! caller's decision.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DiagnosticError;
use crate::transport::AtTransport;

/// SIM status attempts before concluding the SIM is absent or stuck.
const SIM_CHECK_ATTEMPTS: u32 = 5;
/// Delay between SIM status attempts; SIM cold init takes a few seconds.
const SIM_RETRY_DELAY: Duration = Duration::from_secs(2);
/// Cadence of registration re-polls inside the grace window.
const REGISTRATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Run the full diagnostic sequence against the modem.
///
/// `session_start` anchors the registration grace window: the modem gets
/// `network_grace` from the start of the session (not of this call) to reach
/// a registered state before `NetworkNotRegistered` becomes terminal.
///
/// Cancellation aborts any wait and returns `Ok(())` — "no error, stop".
pub async fn run_diagnostics<P>(
    at: &mut AtTransport<P>,
    session_start: Instant,
    network_grace: Duration,
    cancel: &CancellationToken,
) -> Result<(), DiagnosticError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    info!("testing modem connection");
    if let Err(err) = at.command("AT").await {
        error!(error = %err, "modem not responding to AT command");
        return Err(DiagnosticError::ModemNotResponding(format!(
            "no answer to AT probe: {err}"
        )));
    }
    debug!("modem responds to AT");

    // Command echo only adds noise to response parsing.
    let _ = at.command("ATE0").await;

    if let Ok(lines) = at.command("ATI").await {
        info!(model = %lines.join(" "), "modem identity");
    }

    let sim_status = query_sim_status(at, cancel).await;
    if cancel.is_cancelled() {
        return Ok(());
    }

    let Some(status) = sim_status else {
        // The SIM status query keeps failing; an identity query tells a
        // missing SIM apart from one that is still initializing.
        return Err(match at.command("AT+CCID").await {
            Ok(iccid) => {
                info!(iccid = %iccid.join(" "), "SIM physically detected but status query fails");
                DiagnosticError::SimNotDetected(
                    "SIM card detected but not ready (AT+CPIN? fails)".to_string(),
                )
            }
            Err(_) => DiagnosticError::SimNotDetected(
                "SIM card not physically detected (AT+CPIN? and AT+CCID both fail)".to_string(),
            ),
        });
    };

    info!(status = %status, "SIM status");
    // After a reset the modem can emit stale output; anything without the
    // +CPIN: marker is not an answer to our query.
    if !status.contains("+CPIN:") {
        return Err(DiagnosticError::SimNotDetected(format!(
            "unexpected SIM status response: {status}"
        )));
    }

    if status.contains("SIM PIN") {
        return Err(DiagnosticError::SimPinRequired(
            "SIM card requires a PIN code".to_string(),
        ));
    } else if status.contains("SIM PUK") {
        return Err(DiagnosticError::SimPukLocked(
            "SIM card is PUK locked (too many wrong PIN attempts)".to_string(),
        ));
    } else if status.contains("NOT INSERTED") {
        return Err(DiagnosticError::SimNotDetected(
            "no SIM card inserted in modem".to_string(),
        ));
    } else if status.contains("NOT READY") {
        return Err(DiagnosticError::SimNotDetected(
            "SIM card not ready (still initializing)".to_string(),
        ));
    } else if status.contains("READY") {
        info!("SIM card is ready");
    } else {
        return Err(DiagnosticError::SimNotDetected(format!(
            "unknown SIM status: {status}"
        )));
    }

    check_signal(at).await?;

    let mut registration = query_registration(at).await?;
    let mut announced_wait = false;
    while registration.checked && !registration.registered && network_grace > Duration::ZERO {
        let elapsed = session_start.elapsed();
        if elapsed >= network_grace {
            break;
        }
        // Only transient states are worth waiting out.
        if !matches!(registration.status.as_str(), "0" | "2" | "4") {
            break;
        }

        if !announced_wait {
            info!(grace = ?network_grace, elapsed = ?elapsed, "waiting for network registration");
            announced_wait = true;
        }
        let wait = REGISTRATION_POLL_INTERVAL.min(network_grace - elapsed);
        if cancel.run_until_cancelled(sleep(wait)).await.is_none() {
            return Ok(());
        }
        registration = query_registration(at).await?;
    }

    if registration.checked && !registration.registered {
        let status = if registration.status.is_empty() {
            "unknown".to_string()
        } else {
            registration.status
        };
        return Err(DiagnosticError::NetworkNotRegistered(format!(
            "not registered on network (CREG={status})"
        )));
    }

    if let Ok(lines) = at.command("AT+COPS?").await {
        info!(operator = %lines.join(" "), "network operator");
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// Query Steps
// ----------------------------------------------------------------------------

/// Query SIM status, retrying while the SIM finishes cold init.
///
/// Only the final attempt's failure matters; `None` means every attempt
/// failed (or cancellation interrupted the wait).
async fn query_sim_status<P>(at: &mut AtTransport<P>, cancel: &CancellationToken) -> Option<String>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    for attempt in 1..=SIM_CHECK_ATTEMPTS {
        match at.command("AT+CPIN?").await {
            Ok(lines) => return Some(lines.join(" ")),
            Err(err) => {
                if attempt == SIM_CHECK_ATTEMPTS {
                    warn!(error = %err, "SIM status query still failing after retries");
                } else {
                    debug!(attempt, error = %err, "SIM not ready yet, waiting");
                    if cancel.run_until_cancelled(sleep(SIM_RETRY_DELAY)).await.is_none() {
                        return None;
                    }
                }
            }
        }
    }
    None
}

/// Check signal quality; RSSI 99 means no measurable signal at all.
async fn check_signal<P>(at: &mut AtTransport<P>) -> Result<(), DiagnosticError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let lines = match at.command("AT+CSQ").await {
        Ok(lines) => lines,
        Err(err) => {
            warn!(error = %err, "could not check signal quality");
            return Ok(());
        }
    };

    for line in &lines {
        let Some(rest) = line.strip_prefix("+CSQ:") else {
            continue;
        };
        let rssi = rest.split(',').next().unwrap_or_default().trim().to_string();
        match rssi.as_str() {
            "99" => {
                warn!("no signal or signal not detectable");
                return Err(DiagnosticError::NoSignal(format!(
                    "no signal detected (CSQ={rssi})"
                )));
            }
            "0" => warn!("very weak signal (-113 dBm or less)"),
            _ => info!(rssi = %rssi, "signal detected"),
        }
    }
    Ok(())
}

/// One registration poll result.
#[derive(Debug, Default)]
struct Registration {
    /// Whether a parseable `+CREG:` line was seen at all.
    checked: bool,
    registered: bool,
    /// Raw registration status field.
    status: String,
}

/// Query network registration. Denied registration is immediately terminal;
/// a failed query is logged and reported as unchecked.
async fn query_registration<P>(at: &mut AtTransport<P>) -> Result<Registration, DiagnosticError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    let mut registration = Registration::default();
    let lines = match at.command("AT+CREG?").await {
        Ok(lines) => lines,
        Err(err) => {
            warn!(error = %err, "could not check network registration");
            return Ok(registration);
        }
    };
    info!(response = %lines.join(" "), "network registration");

    for line in &lines {
        let Some(rest) = line.strip_prefix("+CREG:") else {
            continue;
        };
        let fields: Vec<&str> = rest.split(',').collect();
        if fields.len() < 2 {
            continue;
        }
        registration.checked = true;
        registration.status = fields[1].trim().to_string();
        match registration.status.as_str() {
            "0" => warn!("not registered, not searching"),
            "1" => {
                info!("registered on home network");
                registration.registered = true;
            }
            "2" => warn!("not registered, searching for network"),
            "3" => {
                error!("network registration denied by operator");
                return Err(DiagnosticError::NetworkDenied(
                    "network operator denied registration".to_string(),
                ));
            }
            "4" => warn!("registration status unknown"),
            "5" => {
                info!("registered, roaming");
                registration.registered = true;
            }
            other => warn!(status = %other, "unrecognized registration status"),
        }
    }

    Ok(registration)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
