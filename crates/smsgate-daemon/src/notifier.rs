//! Failure and recovery alerting
//!
//! Diagnostic verdicts go to the same Telegram chats as the messages, with one
//! refinement: repeats of the same failure kind are suppressed until either a
//! different kind occurs or the gateway recovers. A recovery always re-arms
//! alerting for the next occurrence.

use smsgate_modem::{DiagnosticError, FailureKind};
use tracing::{debug, error, info};

use crate::render::escape_html;
use crate::telegram::MessageSink;

/// Operator-facing hint per failure class.
fn remediation_hint(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::SerialPort => {
            "Cannot open serial port. Check if the modem is connected and the port is correct."
        }
        FailureKind::ModemNotResponding => {
            "Modem is not responding to AT commands. Check power and USB connection."
        }
        FailureKind::SimNotDetected => {
            "SIM card is not inserted or not detected. Check SIM card installation."
        }
        FailureKind::SimPinRequired => {
            "SIM card requires a PIN code. Disable the PIN on the card."
        }
        FailureKind::SimPukLocked => {
            "SIM card is PUK locked. Use the carrier PUK code to unlock it."
        }
        FailureKind::NetworkDenied => {
            "Network operator denied registration. Check SIM activation and account status."
        }
        FailureKind::NetworkNotRegistered => {
            "Modem is not registered on the network. Check signal and antenna."
        }
        FailureKind::NoSignal => "No cellular signal detected. Check antenna and coverage.",
    }
}

// ----------------------------------------------------------------------------
// Notifier
// ----------------------------------------------------------------------------

/// Tracks the last announced failure kind to keep the alert channel quiet
/// while a known problem persists.
pub struct FailureNotifier {
    chat_ids: Vec<i64>,
    dry_run: bool,
    hostname: String,
    last_failure: Option<FailureKind>,
}

impl FailureNotifier {
    pub fn new(chat_ids: Vec<i64>, dry_run: bool, hostname: String) -> Self {
        Self {
            chat_ids,
            dry_run,
            hostname,
            last_failure: None,
        }
    }

    /// Whether a failure is currently announced.
    pub fn has_failure(&self) -> bool {
        self.last_failure.is_some()
    }

    /// Announce a diagnostic failure unless the same kind is already
    /// announced. Returns whether an alert went out.
    pub async fn notify_failure(
        &mut self,
        sink: &dyn MessageSink,
        error: &DiagnosticError,
    ) -> bool {
        let kind = error.kind();
        if self.last_failure == Some(kind) {
            debug!(%kind, "suppressing duplicate failure alert");
            return false;
        }
        info!(%kind, previous = ?self.last_failure, "sending failure alert");

        let text = self.render_failure(error);
        if !self.broadcast(sink, &text).await {
            return false;
        }
        self.last_failure = Some(kind);
        true
    }

    /// Announce recovery if a failure was announced before. Returns whether
    /// an alert went out.
    pub async fn notify_recovery(&mut self, sink: &dyn MessageSink) -> bool {
        let Some(previous) = self.last_failure else {
            debug!("no announced failure, skipping recovery alert");
            return false;
        };
        info!(previous = %previous, "sending recovery alert");

        let text = format!(
            "<b>SMS Gateway Recovered</b>\n\n\
             <b>Host:</b> <code>{}</code>\n\
             <b>Status:</b> Modem is now operational\n\
             <b>Previous error:</b> {}",
            escape_html(&self.hostname),
            previous.name(),
        );
        if !self.broadcast(sink, &text).await {
            return false;
        }
        self.last_failure = None;
        true
    }

    fn render_failure(&self, error: &DiagnosticError) -> String {
        let kind = error.kind();
        format!(
            "<b>SMS Gateway Alert</b>\n\n\
             <b>Host:</b> <code>{}</code>\n\
             <b>Error:</b> {}\n\
             <b>Details:</b> {}\n\n\
             <i>{}</i>",
            escape_html(&self.hostname),
            kind.name(),
            remediation_hint(kind),
            escape_html(error.detail()),
        )
    }

    /// Deliver an alert to every chat. Alerting is best-effort; failures are
    /// logged and reported so the announced state stays accurate.
    async fn broadcast(&self, sink: &dyn MessageSink, text: &str) -> bool {
        if self.dry_run {
            info!(text, "dry run: would send alert to Telegram");
            return true;
        }
        let mut delivered_all = true;
        for &chat_id in &self.chat_ids {
            if let Err(err) = sink.send(chat_id, text).await {
                error!(chat_id, error = %err, "failed to deliver alert");
                delivered_all = false;
            }
        }
        delivered_all
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
