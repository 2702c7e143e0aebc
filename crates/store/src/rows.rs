//! Fixed column lists and row encoding
//!
//! The insert statement's column order is part of the sink contract;
//! encoders here must produce exactly one value per column, in order.

use treeline_primitives::{CertificateFields, CtRow, RekorDetail, RekorRow};

use crate::value::SqlValue;
use crate::Row;

/// Column order of the CT table.
pub const CT_COLUMNS: &[&str] = &[
    "log_id",
    "idx",
    "retrieved_at",
    "entry_ts",
    "entry_kind",
    "raw_leaf",
    "cert_sha256",
    "tbs_sha256",
    "not_before",
    "not_after",
    "subject_cn",
    "subject_o",
    "subject_ou",
    "subject_c",
    "subject_l",
    "subject_st",
    "issuer_cn",
    "issuer_o",
    "issuer_ou",
    "issuer_c",
    "issuer_l",
    "issuer_st",
    "serial_hex",
    "san_dns",
    "san_ip",
    "san_email",
    "san_uri",
    "sig_alg",
    "pubkey_alg",
    "pubkey_bits",
    "is_ca",
    "path_len",
    "key_usage",
    "ext_key_usage",
    "ski_hex",
    "aki_hex",
    "crl_urls",
    "ocsp_urls",
    "issuer_key_hash",
    "has_poison",
];

/// Column order of the Rekor table.
pub const REKOR_COLUMNS: &[&str] = &[
    "tree_id",
    "idx",
    "entry_uuid",
    "retrieved_at",
    "integrated_at",
    "kind",
    "raw_body",
    "data_hash_alg",
    "data_hash_value",
    "sig_format",
    "cert_sha256",
    "tbs_sha256",
    "not_before",
    "not_after",
    "subject_cn",
    "subject_o",
    "subject_ou",
    "subject_c",
    "subject_l",
    "subject_st",
    "issuer_cn",
    "issuer_o",
    "issuer_ou",
    "issuer_c",
    "issuer_l",
    "issuer_st",
    "serial_hex",
    "san_dns",
    "san_ip",
    "san_email",
    "san_uri",
    "sig_alg",
    "pubkey_alg",
    "pubkey_bits",
    "is_ca",
    "extensions_json",
    "pgp_sig_sha256",
    "pgp_fingerprint",
    "pgp_fingerprint_sha1",
    "pgp_key_id",
    "pgp_signer_user_id",
    "pgp_signer_name",
    "pgp_signer_email",
    "pgp_key_alg",
    "pgp_key_bits",
    "pgp_subkey_fingerprints",
];

fn push_dn(row: &mut Row, dn: &treeline_primitives::DnComponents) {
    row.push(SqlValue::opt_str(dn.cn.clone()));
    row.push(SqlValue::Array(dn.o.clone()));
    row.push(SqlValue::Array(dn.ou.clone()));
    row.push(SqlValue::Array(dn.c.clone()));
    row.push(SqlValue::Array(dn.l.clone()));
    row.push(SqlValue::Array(dn.st.clone()));
}

fn push_cert_core(row: &mut Row, cert: &CertificateFields) {
    row.push(SqlValue::opt_datetime(cert.not_before));
    row.push(SqlValue::opt_datetime(cert.not_after));
    push_dn(row, &cert.subject);
    push_dn(row, &cert.issuer);
    row.push(SqlValue::opt_str(cert.serial_hex.clone()));
    row.push(SqlValue::Array(cert.san_dns.clone()));
    row.push(SqlValue::Array(cert.san_ip.clone()));
    row.push(SqlValue::Array(cert.san_email.clone()));
    row.push(SqlValue::Array(cert.san_uri.clone()));
    row.push(SqlValue::opt_str(cert.sig_alg.clone()));
    row.push(SqlValue::opt_str(cert.pubkey_alg.clone()));
    row.push(SqlValue::opt_u64(u64::from(cert.pubkey_bits)));
    row.push(SqlValue::Bool(cert.is_ca));
}

/// Encodes a CT row in [`CT_COLUMNS`] order.
#[must_use]
pub fn encode_ct_row(entry: &CtRow) -> Row {
    let cert = entry.cert.clone().unwrap_or_default();
    let mut row = Row::with_capacity(CT_COLUMNS.len());

    row.push(SqlValue::Str(entry.log_id.clone()));
    row.push(SqlValue::U64(entry.idx));
    row.push(SqlValue::DateTime(entry.retrieved_at));
    row.push(SqlValue::opt_datetime(entry.entry_ts));
    row.push(SqlValue::Str(entry.kind.as_str().to_owned()));
    row.push(SqlValue::Str(entry.raw_leaf.clone()));
    row.push(SqlValue::opt_str(entry.cert_sha256.clone()));
    row.push(SqlValue::opt_str(entry.tbs_sha256.clone()));
    push_cert_core(&mut row, &cert);
    row.push(SqlValue::opt_u64(u64::from(cert.path_len.unwrap_or(0))));
    row.push(SqlValue::Array(cert.key_usage.clone()));
    row.push(SqlValue::Array(cert.ext_key_usage.clone()));
    row.push(SqlValue::opt_str(cert.ski_hex.clone()));
    row.push(SqlValue::opt_str(cert.aki_hex.clone()));
    row.push(SqlValue::Array(cert.crl_urls.clone()));
    row.push(SqlValue::Array(cert.ocsp_urls.clone()));
    row.push(SqlValue::opt_str(entry.issuer_key_hash.clone()));
    row.push(SqlValue::Bool(entry.has_poison));

    debug_assert_eq!(row.len(), CT_COLUMNS.len());
    row
}

/// Encodes a Rekor row in [`REKOR_COLUMNS`] order.
#[must_use]
pub fn encode_rekor_row(entry: &RekorRow) -> Row {
    let mut row = Row::with_capacity(REKOR_COLUMNS.len());

    row.push(SqlValue::Str(entry.tree_id.clone()));
    row.push(SqlValue::U64(entry.idx));
    row.push(SqlValue::Str(entry.entry_uuid.clone()));
    row.push(SqlValue::DateTime(entry.retrieved_at));
    row.push(SqlValue::opt_datetime(entry.integrated_at));
    row.push(SqlValue::opt_str(entry.kind.clone()));
    row.push(SqlValue::Str(entry.raw_body.clone()));
    row.push(SqlValue::opt_str(entry.data_hash_alg.clone()));
    row.push(SqlValue::opt_str(entry.data_hash_value.clone()));
    row.push(SqlValue::opt_str(entry.sig_format.clone()));

    let (cert_sha256, tbs_sha256, cert) = match &entry.detail {
        RekorDetail::X509 {
            cert_sha256,
            tbs_sha256,
            cert,
        } => (
            cert_sha256.clone(),
            tbs_sha256.clone(),
            cert.clone().unwrap_or_default(),
        ),
        _ => (String::new(), String::new(), CertificateFields::default()),
    };

    row.push(SqlValue::opt_str(cert_sha256));
    row.push(SqlValue::opt_str(tbs_sha256));
    push_cert_core(&mut row, &cert);
    row.push(if cert.extensions.is_empty() {
        SqlValue::Null
    } else {
        SqlValue::Str(cert.extensions_json())
    });

    let pgp = match &entry.detail {
        RekorDetail::Pgp(info) => info.clone(),
        _ => treeline_primitives::PgpSignerInfo::default(),
    };

    row.push(SqlValue::opt_str(pgp.sig_sha256));
    row.push(SqlValue::opt_str(pgp.fingerprint));
    row.push(SqlValue::opt_str(pgp.fingerprint_sha1));
    row.push(SqlValue::opt_str(pgp.key_id));
    row.push(SqlValue::opt_str(pgp.signer_user_id));
    row.push(SqlValue::opt_str(pgp.signer_name));
    row.push(SqlValue::opt_str(pgp.signer_email));
    row.push(SqlValue::opt_str(pgp.key_alg));
    row.push(SqlValue::opt_u64(u64::from(pgp.key_bits)));
    row.push(SqlValue::Array(pgp.subkey_fingerprints));

    debug_assert_eq!(row.len(), REKOR_COLUMNS.len());
    row
}
