//! Parsed rows emitted to the columnar sink
//!
//! A row is created from a fetched leaf, committed when the sink
//! acknowledges its batch, and never mutated afterwards. The raw leaf
//! bytes are the durable source of truth; every other field is derived
//! and may be recomputed from them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a CT leaf carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CtEntryKind {
    Certificate,
    Precertificate,
}

impl CtEntryKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Certificate => "certificate",
            Self::Precertificate => "precertificate",
        }
    }
}

/// Distinguished-name components broken out for search.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnComponents {
    pub cn: String,
    pub o: Vec<String>,
    pub ou: Vec<String>,
    pub c: Vec<String>,
    pub l: Vec<String>,
    pub st: Vec<String>,
}

/// A single X.509 extension, preserved verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionValue {
    pub critical: bool,
    /// base64 of the raw extension value bytes.
    pub value: String,
}

/// Structured fields extracted from an X.509 certificate.
///
/// All string fields default to empty when the certificate does not carry
/// the corresponding attribute; array fields default to empty lists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateFields {
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub subject: DnComponents,
    pub issuer: DnComponents,
    /// Hex of the serial number magnitude bytes.
    pub serial_hex: String,
    pub san_dns: Vec<String>,
    pub san_ip: Vec<String>,
    pub san_email: Vec<String>,
    pub san_uri: Vec<String>,
    pub sig_alg: String,
    pub pubkey_alg: String,
    pub pubkey_bits: u32,
    pub is_ca: bool,
    pub path_len: Option<u32>,
    pub key_usage: Vec<String>,
    pub ext_key_usage: Vec<String>,
    pub ski_hex: String,
    pub aki_hex: String,
    pub crl_urls: Vec<String>,
    pub ocsp_urls: Vec<String>,
    /// Every extension on the certificate, keyed by dotted OID.
    pub extensions: BTreeMap<String, ExtensionValue>,
}

impl CertificateFields {
    /// Extensions as one JSON object `{oid: {critical, value}}`, the
    /// shape sinks store as a single blob.
    #[must_use]
    pub fn extensions_json(&self) -> String {
        let map: serde_json::Map<String, serde_json::Value> = self
            .extensions
            .iter()
            .map(|(oid, ext)| {
                (
                    oid.clone(),
                    serde_json::json!({
                        "critical": ext.critical,
                        "value": ext.value,
                    }),
                )
            })
            .collect();

        serde_json::Value::Object(map).to_string()
    }
}

/// One mirrored CT log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtRow {
    pub log_id: String,
    pub idx: u64,
    pub retrieved_at: DateTime<Utc>,
    /// Timestamp from the signed timestamped entry, millisecond precision.
    pub entry_ts: Option<DateTime<Utc>>,
    pub kind: CtEntryKind,
    /// The log's original base64 leaf bytes, kept verbatim.
    pub raw_leaf: String,
    /// SHA-256 over the certificate DER (for precerts, over the TBS).
    pub cert_sha256: String,
    /// SHA-256 over the to-be-signed portion.
    pub tbs_sha256: String,
    /// Present when the certificate parsed; a row without it still
    /// carries the identifiers and hashes above.
    pub cert: Option<CertificateFields>,
    /// Hex of the issuer key hash bound into precert leaves; empty for
    /// final certificates.
    pub issuer_key_hash: String,
    pub has_poison: bool,
}

/// PGP signer identity recovered from an armored public key block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PgpSignerInfo {
    /// SHA-256 over the armored signature block bytes.
    pub sig_sha256: String,
    /// Legacy primary-key fingerprint: SHA-256 over the framed key packet.
    pub fingerprint: String,
    /// RFC 4880 SHA-1 fingerprint of the same packet.
    pub fingerprint_sha1: String,
    /// Last 8 bytes (16 hex chars) of the legacy fingerprint.
    pub key_id: String,
    pub signer_user_id: String,
    pub signer_name: String,
    pub signer_email: String,
    pub key_alg: String,
    pub key_bits: u32,
    pub subkey_fingerprints: Vec<String>,
}

/// Type-dependent payload of a Rekor row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RekorDetail {
    /// hashedrekord whose embedded public key was an X.509 certificate.
    X509 {
        cert_sha256: String,
        tbs_sha256: String,
        cert: Option<CertificateFields>,
    },
    /// rekord signed with a PGP key.
    Pgp(PgpSignerInfo),
    /// Any other kind: only the common metadata is recorded.
    Plain,
}

/// One mirrored Rekor log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekorRow {
    /// Identity of the tree the entry was read from.
    pub tree_id: String,
    /// Tree-local index from the inclusion proof. The global index is
    /// only a transport detail of the batch API and is not persisted.
    pub idx: u64,
    /// The deterministic content-hash identifier returned by the log.
    pub entry_uuid: String,
    pub retrieved_at: DateTime<Utc>,
    pub integrated_at: Option<DateTime<Utc>>,
    pub kind: String,
    /// base64 entry body as returned by the log.
    pub raw_body: String,
    pub data_hash_alg: String,
    pub data_hash_value: String,
    pub sig_format: String,
    pub detail: RekorDetail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_kind_names() {
        assert_eq!(CtEntryKind::Certificate.as_str(), "certificate");
        assert_eq!(CtEntryKind::Precertificate.as_str(), "precertificate");
    }

    #[test]
    fn certificate_fields_default_is_empty() {
        let fields = CertificateFields::default();

        assert!(fields.serial_hex.is_empty());
        assert!(fields.san_dns.is_empty());
        assert!(fields.extensions.is_empty());
        assert_eq!(fields.path_len, None);
        assert!(!fields.is_ca);
    }
}
