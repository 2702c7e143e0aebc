//! Rekor entry body parsing
//!
//! The base64 body decodes to `{apiVersion, kind, spec}`. Common
//! metadata (`spec.data.hash`, `spec.signature.format`) is lifted for
//! every kind; hashedrekord and PGP-signed rekord entries additionally
//! surface the embedded certificate or key identity. Unknown kinds keep
//! just the metadata; the raw body is always persisted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use x509_parser::pem::parse_x509_pem;

use treeline_primitives::{PgpSignerInfo, RekorDetail, RekorRow};

use crate::error::ParseError;
use crate::{pgp, x509};

/// Everything the parser needs to know about one retrieved entry.
#[derive(Clone, Copy, Debug)]
pub struct RekorEntryInput<'a> {
    /// Active tree id announced by the log; rows must agree with it.
    pub expected_tree_id: &'a str,
    /// Tree-local index from the inclusion proof.
    pub local_index: u64,
    pub uuid: &'a str,
    pub body_b64: &'a str,
    /// Unix seconds.
    pub integrated_time: i64,
    /// Checkpoint text from the inclusion proof, when present.
    pub checkpoint: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct BodyEnvelope {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    spec: Value,
}

/// Extracts the tree id from a checkpoint's first line
/// (`"<log host> - <tree id>"`).
#[must_use]
pub fn checkpoint_tree_id(checkpoint: &str) -> Option<&str> {
    let first_line = checkpoint.lines().next()?;
    let (_host, tree_id) = first_line.split_once(" - ")?;
    let tree_id = tree_id.trim();
    (!tree_id.is_empty()).then_some(tree_id)
}

/// Parses one entry into a sink row.
///
/// A checkpoint naming a different tree than announced is fatal: the
/// returned error unwinds the whole fetch loop. Every other failure
/// degrades to a row with raw body and whatever metadata was recovered.
pub fn parse_entry(
    input: RekorEntryInput<'_>,
    retrieved_at: DateTime<Utc>,
) -> Result<RekorRow, ParseError> {
    if let Some(checkpoint) = input.checkpoint {
        match checkpoint_tree_id(checkpoint) {
            Some(found) if found != input.expected_tree_id => {
                return Err(ParseError::CheckpointMismatch {
                    expected: input.expected_tree_id.to_owned(),
                    found: found.to_owned(),
                });
            }
            Some(_) => {}
            None => {
                warn!(uuid = input.uuid, "checkpoint without a parseable tree id");
            }
        }
    }

    let mut row = RekorRow {
        tree_id: input.expected_tree_id.to_owned(),
        idx: input.local_index,
        entry_uuid: input.uuid.to_owned(),
        retrieved_at,
        integrated_at: (input.integrated_time > 0)
            .then(|| Utc.timestamp_opt(input.integrated_time, 0).single())
            .flatten(),
        kind: String::new(),
        raw_body: input.body_b64.to_owned(),
        data_hash_alg: String::new(),
        data_hash_value: String::new(),
        sig_format: String::new(),
        detail: RekorDetail::Plain,
    };

    let decoded = match BASE64.decode(input.body_b64.trim()) {
        Ok(decoded) => decoded,
        Err(err) => {
            warn!(uuid = input.uuid, error = %err, "entry body is not base64, keeping raw row");
            return Ok(row);
        }
    };

    let envelope: BodyEnvelope = match serde_json::from_slice(&decoded) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(uuid = input.uuid, error = %err, "entry body is not the expected JSON shape");
            return Ok(row);
        }
    };

    row.kind = envelope.kind.clone();

    if let Some(alg) = envelope.spec.pointer("/data/hash/algorithm").and_then(Value::as_str) {
        row.data_hash_alg = alg.to_owned();
    }
    if let Some(value) = envelope.spec.pointer("/data/hash/value").and_then(Value::as_str) {
        row.data_hash_value = value.to_owned();
    }
    if let Some(format) = envelope.spec.pointer("/signature/format").and_then(Value::as_str) {
        row.sig_format = format.to_owned();
    }

    row.detail = match envelope.kind.as_str() {
        "hashedrekord" => hashedrekord_detail(&envelope.spec, input.uuid),
        "rekord" if row.sig_format == "pgp" => pgp_detail(&envelope.spec, input.uuid),
        _ => RekorDetail::Plain,
    };

    Ok(row)
}

/// hashedrekord: the public key slot usually holds a PEM certificate.
fn hashedrekord_detail(spec: &Value, uuid: &str) -> RekorDetail {
    let Some(content) = spec
        .pointer("/signature/publicKey/content")
        .and_then(Value::as_str)
    else {
        return RekorDetail::Plain;
    };

    let Ok(pem_bytes) = BASE64.decode(content.trim()) else {
        debug!(uuid, "public key content is not base64");
        return RekorDetail::Plain;
    };

    let Ok((_, pem)) = parse_x509_pem(&pem_bytes) else {
        // Raw public keys land here; only certificates carry fields.
        return RekorDetail::Plain;
    };

    if pem.label != "CERTIFICATE" {
        return RekorDetail::Plain;
    }

    let cert_sha256 = hex::encode(Sha256::digest(&pem.contents));

    match x509::extract_certificate(&pem.contents) {
        Ok((fields, tbs_raw)) => RekorDetail::X509 {
            cert_sha256,
            tbs_sha256: hex::encode(Sha256::digest(&tbs_raw)),
            cert: Some(fields),
        },
        Err(err) => {
            warn!(uuid, error = %err, "embedded certificate did not parse");
            RekorDetail::X509 {
                cert_sha256,
                tbs_sha256: String::new(),
                cert: None,
            }
        }
    }
}

/// rekord with a PGP signature: reduce the armored key block to the
/// signer identity.
fn pgp_detail(spec: &Value, uuid: &str) -> RekorDetail {
    let Some(key_content) = spec
        .pointer("/signature/publicKey/content")
        .and_then(Value::as_str)
    else {
        return RekorDetail::Plain;
    };

    let Ok(armored_bytes) = BASE64.decode(key_content.trim()) else {
        debug!(uuid, "pgp public key content is not base64");
        return RekorDetail::Plain;
    };
    let armored = String::from_utf8_lossy(&armored_bytes);

    let block = match pgp::parse_key_block(&armored) {
        Ok(block) => block,
        Err(err) => {
            warn!(uuid, error = %err, "pgp key block did not parse");
            return RekorDetail::Plain;
        }
    };

    let mut info = PgpSignerInfo::default();

    if let Some(sig_content) = spec.pointer("/signature/content").and_then(Value::as_str) {
        if let Ok(sig_bytes) = BASE64.decode(sig_content.trim()) {
            info.sig_sha256 = hex::encode(Sha256::digest(&sig_bytes));
        }
    }

    if let Some(primary) = &block.primary {
        info.fingerprint = primary.fingerprint.clone();
        info.fingerprint_sha1 = primary.fingerprint_sha1.clone();
        info.key_id = primary.key_id.clone();
        info.key_alg = primary.algorithm.clone();
        info.key_bits = primary.bits;
    }

    if let Some(user_id) = &block.primary_user_id {
        let (name, email) = pgp::parse_user_id(user_id);
        info.signer_user_id = user_id.clone();
        info.signer_name = name;
        info.signer_email = email;
    }

    info.subkey_fingerprints = block
        .subkeys
        .iter()
        .map(|subkey| subkey.fingerprint.clone())
        .collect();

    RekorDetail::Pgp(info)
}
