//! Entry parsers for the mirrored logs
//!
//! Turns raw leaves into the structured rows in `treeline-primitives`:
//!
//! - [`ct`] decodes the RFC 6962 binary leaf wrapper and dispatches to
//!   the certificate / precertificate handlers,
//! - [`rekor`] decodes the JSON entry body and dispatches on its kind,
//! - [`x509`] extracts searchable fields from DER certificates,
//! - [`pgp`] walks armored public key blocks packet by packet.
//!
//! Parsing is lossy by policy, never silently: when a sub-structure
//! fails to parse the row is still produced with the raw bytes and
//! whatever was recovered, and the failure is logged.

pub mod ct;
pub mod error;
pub mod pgp;
pub mod rekor;
pub mod x509;

pub use error::ParseError;
