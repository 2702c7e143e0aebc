//! Shared types for the transparency-log mirroring pipeline
//!
//! This crate holds the data model that flows between the log clients,
//! the entry parsers, the ingest pipeline and the columnar sink. It is
//! deliberately free of I/O so that every consumer can be tested against
//! plain values.

pub mod entry;
pub mod state;

pub use entry::{
    CertificateFields, CtEntryKind, CtRow, DnComponents, ExtensionValue, PgpSignerInfo, RekorDetail,
    RekorRow,
};
pub use state::{log_identity_from_url, InactiveShard, LogState};
