//! Transport and diagnostic error taxonomy
//!
//! Two layers of failure live here. [`AtError`] is what a single command
//! exchange can produce; callers branch on its two predicates rather than on
//! exact variants. [`DiagnosticError`] is the terminal verdict of a diagnostic
//! run; a healthy modem produces no verdict at all.

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Failure of one AT command exchange.
#[derive(Debug, thiserror::Error)]
pub enum AtError {
    #[error("failed to write to modem: {0}")]
    WriteFailed(std::io::Error),

    /// No response data arrived at all; the link is most likely gone.
    #[error("modem disconnected: no response data received")]
    Disconnected,

    /// The device produced some data but never a terminator; it is slow or
    /// busy rather than gone.
    #[error("modem timeout: {0}")]
    Timeout(String),

    /// The device answered with an error line (`ERROR`, `+CME ERROR: ...`,
    /// `+CMS ERROR: ...`), reproduced verbatim.
    #[error("modem reported error: {line}")]
    Device { line: String },
}

impl AtError {
    /// Timeout or link-loss kind of failure: retrying later may help, and a
    /// run of these in a row means the modem has stopped talking.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AtError::Timeout(_) | AtError::Disconnected)
    }

    /// The device itself reported an error. The link works; the command or
    /// the SIM/network state behind it is the problem.
    pub fn is_device_error(&self) -> bool {
        matches!(self, AtError::Device { .. })
    }
}

// ----------------------------------------------------------------------------
// Diagnostic Verdicts
// ----------------------------------------------------------------------------

/// Structural failure classes, used by the alert side-channel to suppress
/// repeats of the same problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    SerialPort,
    ModemNotResponding,
    SimNotDetected,
    SimPinRequired,
    SimPukLocked,
    NetworkDenied,
    NetworkNotRegistered,
    NoSignal,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::SerialPort => "Serial Port Error",
            FailureKind::ModemNotResponding => "Modem Not Responding",
            FailureKind::SimNotDetected => "SIM Not Detected",
            FailureKind::SimPinRequired => "SIM PIN Required",
            FailureKind::SimPukLocked => "SIM PUK Locked",
            FailureKind::NetworkDenied => "Network Denied",
            FailureKind::NetworkNotRegistered => "Network Not Registered",
            FailureKind::NoSignal => "No Signal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Terminal verdict of a diagnostic run, with human-readable detail.
///
/// A verdict ends the current modem session; the supervisor decides what to
/// do next (plain retry, or a full modem reset for the SIM and
/// registration-denied classes).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiagnosticError {
    #[error("serial port unavailable: {0}")]
    SerialPortUnavailable(String),

    #[error("modem not responding: {0}")]
    ModemNotResponding(String),

    #[error("SIM card not detected: {0}")]
    SimNotDetected(String),

    #[error("SIM PIN required: {0}")]
    SimPinRequired(String),

    #[error("SIM PUK locked: {0}")]
    SimPukLocked(String),

    #[error("network registration denied: {0}")]
    NetworkDenied(String),

    #[error("not registered on network: {0}")]
    NetworkNotRegistered(String),

    #[error("no signal: {0}")]
    NoSignal(String),
}

impl DiagnosticError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DiagnosticError::SerialPortUnavailable(_) => FailureKind::SerialPort,
            DiagnosticError::ModemNotResponding(_) => FailureKind::ModemNotResponding,
            DiagnosticError::SimNotDetected(_) => FailureKind::SimNotDetected,
            DiagnosticError::SimPinRequired(_) => FailureKind::SimPinRequired,
            DiagnosticError::SimPukLocked(_) => FailureKind::SimPukLocked,
            DiagnosticError::NetworkDenied(_) => FailureKind::NetworkDenied,
            DiagnosticError::NetworkNotRegistered(_) => FailureKind::NetworkNotRegistered,
            DiagnosticError::NoSignal(_) => FailureKind::NoSignal,
        }
    }

    /// The detail string carried by every variant.
    pub fn detail(&self) -> &str {
        match self {
            DiagnosticError::SerialPortUnavailable(detail)
            | DiagnosticError::ModemNotResponding(detail)
            | DiagnosticError::SimNotDetected(detail)
            | DiagnosticError::SimPinRequired(detail)
            | DiagnosticError::SimPukLocked(detail)
            | DiagnosticError::NetworkDenied(detail)
            | DiagnosticError::NetworkNotRegistered(detail)
            | DiagnosticError::NoSignal(detail) => detail,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
