//! Full modem reset
//!
//! SIM-level failures (missing, PIN, PUK) and denied registration are rarely
//! cured by retrying commands; toggling the modem's functionality off and on
//! re-initializes the SIM from scratch. Command results are deliberately
//! ignored here — the diagnostics pass that follows the reset is the judge of
//! whether it worked.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::transport::AtTransport;

/// Settle time after dropping to minimum functionality (RF off).
const RF_OFF_SETTLE: Duration = Duration::from_secs(2);
/// Settle time after restoring full functionality; the SIM re-initializes.
const SIM_REINIT_SETTLE: Duration = Duration::from_secs(5);
/// Sync probes issued to flush stale output after the reset.
const SYNC_PROBES: u32 = 3;
const SYNC_PROBE_DELAY: Duration = Duration::from_millis(200);

/// Power-cycle the modem's functionality and resynchronize the command
/// stream. Every settle delay aborts early on cancellation.
pub async fn reset_modem<P>(at: &mut AtTransport<P>, cancel: &CancellationToken)
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    info!("performing full modem reset to recover from previous failure");

    let _ = at.command("AT+CFUN=0").await;
    if cancel.run_until_cancelled(sleep(RF_OFF_SETTLE)).await.is_none() {
        return;
    }

    let _ = at.command("AT+CFUN=1").await;
    if cancel.run_until_cancelled(sleep(SIM_REINIT_SETTLE)).await.is_none() {
        return;
    }

    // The modem may emit garbage while resetting; a few probes resynchronize
    // the command/response stream before anyone parses responses again.
    for _ in 0..SYNC_PROBES {
        let _ = at.command("AT").await;
        if cancel.run_until_cancelled(sleep(SYNC_PROBE_DELAY)).await.is_none() {
            return;
        }
    }

    let _ = at.command("ATE0").await;
    let _ = cancel.run_until_cancelled(sleep(SYNC_PROBE_DELAY)).await;

    info!("modem reset complete");
}
