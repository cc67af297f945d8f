//! AT command transport and modem diagnostics
//!
//! The serial side of the smsgate gateway: framing synchronous AT command
//! exchanges over a half-duplex byte stream, classifying transport failures,
//! and running the diagnostic sequence that turns a misbehaving modem into a
//! typed verdict (SIM missing, PIN locked, no signal, registration denied...).
//!
//! The transport is generic over any `AsyncRead + AsyncWrite` stream, so tests
//! drive it with an in-memory duplex pipe while production opens a serial port
//! through [`transport::open_serial`]. Only one command may be outstanding at
//! a time; the transport takes `&mut self` to make overlap unrepresentable.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod diagnostics;
pub mod error;
pub mod recovery;
pub mod transport;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use diagnostics::run_diagnostics;
pub use error::{AtError, DiagnosticError, FailureKind};
pub use recovery::reset_modem;
pub use transport::{open_serial, AtTransport};
