//! RFC 6962 binary leaf decoding
//!
//! A `get-entries` leaf is a base64 `MerkleTreeLeaf`: a one-byte
//! version, a one-byte leaf type, then the `TimestampedEntry` (64-bit
//! timestamp, 16-bit entry type, type-specific body, extensions). Some
//! logs have been observed handing back a bare `TimestampedEntry`
//! without the wrapper; those are accepted with a warning and V1
//! metadata synthesized.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;

use treeline_primitives::{CtEntryKind, CtRow};

use crate::error::ParseError;
use crate::x509;

const LEAF_VERSION_V1: u8 = 0;
const LEAF_TYPE_TIMESTAMPED_ENTRY: u8 = 0;
const ENTRY_TYPE_X509: u16 = 0;
const ENTRY_TYPE_PRECERT: u16 = 1;

/// A decoded `TimestampedEntry`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedLeaf {
    pub timestamp_ms: u64,
    pub body: LeafBody,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeafBody {
    /// End certificate, DER bytes.
    X509 { der: Vec<u8> },
    /// Precertificate: the issuer key hash bound into the leaf plus the
    /// DER of the to-be-signed portion.
    Precert {
        issuer_key_hash: [u8; 32],
        tbs: Vec<u8>,
    },
}

impl DecodedLeaf {
    #[must_use]
    pub const fn kind(&self) -> CtEntryKind {
        match self.body {
            LeafBody::X509 { .. } => CtEntryKind::Certificate,
            LeafBody::Precert { .. } => CtEntryKind::Precertificate,
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], ParseError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ParseError::Truncated(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ParseError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ParseError> {
        let b = self.take(2, what)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, ParseError> {
        let b = self.take(3, what)?;
        Ok(usize::from(b[0]) << 16 | usize::from(b[1]) << 8 | usize::from(b[2]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, ParseError> {
        let b = self.take(8, what)?;
        let mut bytes = [0_u8; 8];
        bytes.copy_from_slice(b);
        Ok(u64::from_be_bytes(bytes))
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Decodes leaf bytes, accepting both the standard wrapper and a bare
/// `TimestampedEntry`. The boolean is true when the wrapper was absent.
pub fn decode_leaf(raw: &[u8]) -> Result<(DecodedLeaf, bool), ParseError> {
    match decode_wrapped(raw) {
        Ok(leaf) => Ok((leaf, false)),
        Err(wrapped_err) => match decode_timestamped(&mut Cursor::new(raw)) {
            Ok(leaf) => Ok((leaf, true)),
            Err(_) => Err(wrapped_err),
        },
    }
}

fn decode_wrapped(raw: &[u8]) -> Result<DecodedLeaf, ParseError> {
    let mut cur = Cursor::new(raw);

    let version = cur.u8("leaf version")?;
    if version != LEAF_VERSION_V1 {
        return Err(ParseError::UnsupportedVersion(version));
    }

    let leaf_type = cur.u8("leaf type")?;
    if leaf_type != LEAF_TYPE_TIMESTAMPED_ENTRY {
        return Err(ParseError::UnsupportedLeafType(leaf_type));
    }

    decode_timestamped(&mut cur)
}

fn decode_timestamped(cur: &mut Cursor<'_>) -> Result<DecodedLeaf, ParseError> {
    let timestamp_ms = cur.u64("entry timestamp")?;
    let entry_type = cur.u16("entry type")?;

    let body = match entry_type {
        ENTRY_TYPE_X509 => {
            let len = cur.u24("certificate length")?;
            let der = cur.take(len, "certificate bytes")?.to_vec();
            LeafBody::X509 { der }
        }
        ENTRY_TYPE_PRECERT => {
            let hash = cur.take(32, "issuer key hash")?;
            let mut issuer_key_hash = [0_u8; 32];
            issuer_key_hash.copy_from_slice(hash);

            let len = cur.u24("tbs length")?;
            let tbs = cur.take(len, "tbs bytes")?.to_vec();
            LeafBody::Precert {
                issuer_key_hash,
                tbs,
            }
        }
        other => return Err(ParseError::UnsupportedEntryType(other)),
    };

    // CtExtensions. Tolerate their absence; a few logs trim the empty
    // trailer.
    if cur.remaining() >= 2 {
        let ext_len = cur.u16("extensions length")?;
        let _extensions = cur.take(ext_len.into(), "extensions")?;
    }

    Ok(DecodedLeaf { timestamp_ms, body })
}

/// Parses one leaf into a sink row.
///
/// Certificate-level failures degrade: the row keeps the identifiers,
/// the hashes that could be computed, and the raw leaf. Only a leaf
/// whose framing itself is broken returns an error.
pub fn parse_leaf(
    log_id: &str,
    idx: u64,
    leaf_b64: &str,
    retrieved_at: DateTime<Utc>,
) -> Result<CtRow, ParseError> {
    let raw = BASE64.decode(leaf_b64.trim())?;
    let (leaf, bare) = decode_leaf(&raw)?;

    if bare {
        warn!(log_id, idx, "leaf without MerkleTreeLeaf wrapper, assuming bare TimestampedEntry");
    }

    let entry_ts = Utc.timestamp_millis_opt(leaf.timestamp_ms as i64).single();
    let kind = leaf.kind();

    let mut row = CtRow {
        log_id: log_id.to_owned(),
        idx,
        retrieved_at,
        entry_ts,
        kind,
        raw_leaf: leaf_b64.to_owned(),
        cert_sha256: String::new(),
        tbs_sha256: String::new(),
        cert: None,
        issuer_key_hash: String::new(),
        has_poison: false,
    };

    match leaf.body {
        LeafBody::X509 { der } => {
            row.cert_sha256 = hex::encode(Sha256::digest(&der));

            match x509::extract_certificate(&der) {
                Ok((fields, tbs_raw)) => {
                    row.tbs_sha256 = hex::encode(Sha256::digest(&tbs_raw));
                    row.cert = Some(fields);
                }
                Err(err) => {
                    warn!(log_id, idx, error = %err, "certificate did not parse, keeping raw row");
                }
            }
        }
        LeafBody::Precert {
            issuer_key_hash,
            tbs,
        } => {
            // The TBS hash stands in for both hash columns on precerts.
            let tbs_hash = hex::encode(Sha256::digest(&tbs));
            row.cert_sha256 = tbs_hash.clone();
            row.tbs_sha256 = tbs_hash;
            row.issuer_key_hash = hex::encode(issuer_key_hash);

            match x509::extract_tbs(&tbs) {
                Ok(fields) => {
                    row.has_poison = x509::has_poison(&fields);
                    row.cert = Some(fields);
                }
                Err(err) => {
                    warn!(log_id, idx, error = %err, "precert tbs did not parse, keeping raw row");
                }
            }
        }
    }

    Ok(row)
}
