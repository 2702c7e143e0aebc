//! Searchable field extraction from X.509 certificates
//!
//! Built on `x509-parser`. Extraction is best-effort per field: an
//! attribute that fails to decode leaves its column empty rather than
//! failing the certificate.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use x509_parser::certificate::TbsCertificate;
use x509_parser::extensions::{
    DistributionPointName, GeneralName, ParsedExtension, SubjectAlternativeName,
};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use treeline_primitives::{CertificateFields, DnComponents, ExtensionValue};

use crate::error::ParseError;

/// OID of the CT precertificate poison extension.
pub const POISON_OID: &str = "1.3.6.1.4.1.11129.2.4.3";

const OCSP_ACCESS_METHOD_OID: &str = "1.3.6.1.5.5.7.48.1";

/// Parses a DER certificate and returns its extracted fields along with
/// the raw bytes of the to-be-signed portion.
pub fn extract_certificate(der: &[u8]) -> Result<(CertificateFields, Vec<u8>), ParseError> {
    let (_, cert) =
        parse_x509_certificate(der).map_err(|err| ParseError::Certificate(err.to_string()))?;

    let tbs_raw = cert.tbs_certificate.as_ref().to_vec();
    let mut fields = fields_from_tbs(&cert.tbs_certificate);
    // The outer signature algorithm is authoritative; the TBS copy can
    // disagree on malformed certificates.
    fields.sig_alg = signature_algorithm_name(&cert.signature_algorithm.algorithm.to_id_string());

    Ok((fields, tbs_raw))
}

/// Parses a bare TBSCertificate, as found in precertificate leaves.
pub fn extract_tbs(der: &[u8]) -> Result<CertificateFields, ParseError> {
    let (_, tbs) =
        TbsCertificate::from_der(der).map_err(|err| ParseError::Certificate(err.to_string()))?;

    Ok(fields_from_tbs(&tbs))
}

fn fields_from_tbs(tbs: &TbsCertificate<'_>) -> CertificateFields {
    let mut fields = CertificateFields {
        not_before: asn1_time_to_utc(tbs.validity.not_before.timestamp()),
        not_after: asn1_time_to_utc(tbs.validity.not_after.timestamp()),
        subject: dn_components(&tbs.subject),
        issuer: dn_components(&tbs.issuer),
        serial_hex: tbs.serial.to_str_radix(16),
        sig_alg: signature_algorithm_name(&tbs.signature.algorithm.to_id_string()),
        ..CertificateFields::default()
    };

    let (pubkey_alg, pubkey_bits) = public_key_info(&tbs.subject_pki);
    fields.pubkey_alg = pubkey_alg;
    fields.pubkey_bits = pubkey_bits;

    for ext in tbs.extensions() {
        let oid = ext.oid.to_id_string();

        let _previous = fields.extensions.insert(
            oid,
            ExtensionValue {
                critical: ext.critical,
                value: BASE64.encode(ext.value),
            },
        );

        match ext.parsed_extension() {
            ParsedExtension::BasicConstraints(bc) => {
                fields.is_ca = bc.ca;
                fields.path_len = bc.path_len_constraint;
            }
            ParsedExtension::KeyUsage(ku) => {
                fields.key_usage = key_usage_names(ku);
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                fields.ext_key_usage = extended_key_usage_names(eku);
            }
            ParsedExtension::SubjectAlternativeName(san) => {
                collect_sans(san, &mut fields);
            }
            ParsedExtension::SubjectKeyIdentifier(ski) => {
                fields.ski_hex = hex::encode(ski.0);
            }
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                if let Some(id) = &aki.key_identifier {
                    fields.aki_hex = hex::encode(id.0);
                }
            }
            ParsedExtension::CRLDistributionPoints(crl) => {
                for point in &crl.points {
                    let Some(DistributionPointName::FullName(names)) = &point.distribution_point
                    else {
                        continue;
                    };
                    for name in names {
                        if let GeneralName::URI(uri) = name {
                            fields.crl_urls.push((*uri).to_owned());
                        }
                    }
                }
            }
            ParsedExtension::AuthorityInfoAccess(aia) => {
                for desc in &aia.accessdescs {
                    if desc.access_method.to_id_string() == OCSP_ACCESS_METHOD_OID {
                        if let GeneralName::URI(uri) = &desc.access_location {
                            fields.ocsp_urls.push((*uri).to_owned());
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fields
}

/// Whether a parsed TBS carries the CT poison extension.
#[must_use]
pub fn has_poison(fields: &CertificateFields) -> bool {
    fields.extensions.contains_key(POISON_OID)
}

fn asn1_time_to_utc(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn dn_components(name: &X509Name<'_>) -> DnComponents {
    let cn = attr_values(name.iter_common_name())
        .into_iter()
        .next()
        .unwrap_or_default();

    DnComponents {
        cn,
        o: attr_values(name.iter_organization()),
        ou: attr_values(name.iter_organizational_unit()),
        c: attr_values(name.iter_country()),
        l: attr_values(name.iter_locality()),
        st: attr_values(name.iter_state_or_province()),
    }
}

fn attr_values<'a>(
    iter: impl Iterator<Item = &'a AttributeTypeAndValue<'a>>,
) -> Vec<String> {
    iter.filter_map(|attr| attr.as_str().ok().map(ToOwned::to_owned))
        .collect()
}

fn collect_sans(san: &SubjectAlternativeName<'_>, fields: &mut CertificateFields) {
    for name in &san.general_names {
        match name {
            GeneralName::DNSName(dns) => fields.san_dns.push((*dns).to_owned()),
            GeneralName::IPAddress(bytes) => fields.san_ip.push(format_ip(bytes)),
            GeneralName::RFC822Name(email) => fields.san_email.push((*email).to_owned()),
            GeneralName::URI(uri) => fields.san_uri.push((*uri).to_owned()),
            _ => {}
        }
    }
}

/// Renders a SAN IP payload as a display string. Unexpected widths fall
/// back to hex so the value is never dropped.
#[must_use]
pub fn format_ip(bytes: &[u8]) -> String {
    match bytes.len() {
        4 => std::net::Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string(),
        16 => {
            let mut octets = [0_u8; 16];
            octets.copy_from_slice(bytes);
            std::net::Ipv6Addr::from(octets).to_string()
        }
        _ => hex::encode(bytes),
    }
}

fn public_key_info(spki: &SubjectPublicKeyInfo<'_>) -> (String, u32) {
    let alg = match spki.algorithm.algorithm.to_id_string().as_str() {
        "1.2.840.113549.1.1.1" => "RSA".to_owned(),
        "1.2.840.10045.2.1" => "ECDSA".to_owned(),
        "1.2.840.10040.4.1" => "DSA".to_owned(),
        "1.3.101.112" => "Ed25519".to_owned(),
        "1.3.101.110" => "X25519".to_owned(),
        other => other.to_owned(),
    };

    let bits = match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => rsa.key_size() as u32,
        Ok(PublicKey::EC(point)) => point.key_size() as u32,
        _ => 0,
    };

    (alg, bits)
}

/// Maps a signature algorithm OID onto its conventional short name.
#[must_use]
pub fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.4" => "MD5-RSA".to_owned(),
        "1.2.840.113549.1.1.5" => "SHA1-RSA".to_owned(),
        "1.2.840.113549.1.1.10" => "RSA-PSS".to_owned(),
        "1.2.840.113549.1.1.11" => "SHA256-RSA".to_owned(),
        "1.2.840.113549.1.1.12" => "SHA384-RSA".to_owned(),
        "1.2.840.113549.1.1.13" => "SHA512-RSA".to_owned(),
        "1.2.840.10045.4.1" => "ECDSA-SHA1".to_owned(),
        "1.2.840.10045.4.3.2" => "ECDSA-SHA256".to_owned(),
        "1.2.840.10045.4.3.3" => "ECDSA-SHA384".to_owned(),
        "1.2.840.10045.4.3.4" => "ECDSA-SHA512".to_owned(),
        "1.2.840.10040.4.3" => "DSA-SHA1".to_owned(),
        "1.3.101.112" => "Ed25519".to_owned(),
        other => other.to_owned(),
    }
}

fn key_usage_names(ku: &KeyUsage) -> Vec<String> {
    let mut names = Vec::new();

    let flags: [(bool, &str); 9] = [
        (ku.digital_signature(), "digital_signature"),
        (ku.non_repudiation(), "non_repudiation"),
        (ku.key_encipherment(), "key_encipherment"),
        (ku.data_encipherment(), "data_encipherment"),
        (ku.key_agreement(), "key_agreement"),
        (ku.key_cert_sign(), "key_cert_sign"),
        (ku.crl_sign(), "crl_sign"),
        (ku.encipher_only(), "encipher_only"),
        (ku.decipher_only(), "decipher_only"),
    ];

    for (set, name) in flags {
        if set {
            names.push(name.to_owned());
        }
    }

    names
}

fn extended_key_usage_names(eku: &ExtendedKeyUsage<'_>) -> Vec<String> {
    let mut names = Vec::new();

    if eku.any {
        names.push("any".to_owned());
    }
    if eku.server_auth {
        names.push("server_auth".to_owned());
    }
    if eku.client_auth {
        names.push("client_auth".to_owned());
    }
    if eku.code_signing {
        names.push("code_signing".to_owned());
    }
    if eku.email_protection {
        names.push("email_protection".to_owned());
    }
    if eku.time_stamping {
        names.push("time_stamping".to_owned());
    }
    if eku.ocsp_signing {
        names.push("ocsp_signing".to_owned());
    }
    for oid in &eku.other {
        names.push(oid.to_id_string());
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_oids_map_to_short_names() {
        assert_eq!(signature_algorithm_name("1.2.840.113549.1.1.11"), "SHA256-RSA");
        assert_eq!(signature_algorithm_name("1.2.840.10045.4.3.2"), "ECDSA-SHA256");
        assert_eq!(signature_algorithm_name("1.3.101.112"), "Ed25519");
        assert_eq!(signature_algorithm_name("1.2.3.4"), "1.2.3.4");
    }

    #[test]
    fn ip_rendering_handles_both_families() {
        assert_eq!(format_ip(&[192, 0, 2, 1]), "192.0.2.1");
        assert_eq!(
            format_ip(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]),
            "2001:db8::1"
        );
        assert_eq!(format_ip(&[1, 2, 3]), "010203");
    }

    #[test]
    fn garbage_der_is_a_certificate_error() {
        assert!(matches!(
            extract_certificate(b"not a certificate"),
            Err(ParseError::Certificate(_))
        ));
        assert!(matches!(
            extract_tbs(&[0x30, 0x03, 0x02, 0x01]),
            Err(ParseError::Certificate(_))
        ));
    }

    #[test]
    fn extensions_serialize_to_stable_json() {
        let mut fields = CertificateFields::default();
        let _ = fields.extensions.insert(
            "2.5.29.19".to_owned(),
            ExtensionValue {
                critical: true,
                value: "MAA=".to_owned(),
            },
        );

        assert_eq!(
            fields.extensions_json(),
            r#"{"2.5.29.19":{"critical":true,"value":"MAA="}}"#
        );
    }
}
