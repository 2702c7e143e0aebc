//! PGP public-key block parsing
//!
//! Rekor `rekord` entries embed ASCII-armored public key blocks. We do
//! not need the full OpenPGP surface, only the identity of the signer:
//! armor is stripped by line shape, the packet stream is walked with
//! both old- and new-format framing, and key packets are reduced to
//! algorithm, size and fingerprints.
//!
//! The primary fingerprint here is SHA-256 over the framed key packet
//! (`0x99 || u16be(len) || body`). That formula predates this codebase's
//! stored rows and must stay bit-for-bit stable; the RFC 4880 SHA-1
//! fingerprint over the same frame is carried in a separate field.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::ParseError;

const TAG_PUBLIC_KEY: u8 = 6;
const TAG_USER_ID: u8 = 13;
const TAG_PUBLIC_SUBKEY: u8 = 14;

/// One packet span from the stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgpPacket {
    pub tag: u8,
    pub body: Vec<u8>,
}

/// Identity of one public key or subkey packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PgpPublicKey {
    pub created: Option<DateTime<Utc>>,
    pub algorithm: String,
    pub bits: u32,
    /// SHA-256 over the framed packet (legacy formula, see module docs).
    pub fingerprint: String,
    /// RFC 4880 SHA-1 over the same frame.
    pub fingerprint_sha1: String,
    /// Last 8 bytes of the legacy fingerprint, hex.
    pub key_id: String,
}

/// Everything recovered from one armored key block.
#[derive(Clone, Debug, Default)]
pub struct PgpKeyBlockInfo {
    pub primary: Option<PgpPublicKey>,
    pub subkeys: Vec<PgpPublicKey>,
    /// First User ID packet in the stream.
    pub primary_user_id: Option<String>,
}

/// Strips ASCII armor down to the base64 payload and decodes it.
///
/// Dropped lines: the `-----` begin/end markers, `Version:`/`Comment:`
/// headers, blanks, and the `=`-prefixed CRC-24 line after the body.
pub fn strip_armor(text: &str) -> Result<Vec<u8>, ParseError> {
    let mut payload = String::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty()
            || line.starts_with("-----")
            || line.starts_with("Version:")
            || line.starts_with("Comment:")
            || line.starts_with('=')
        {
            continue;
        }
        payload.push_str(line);
    }

    Ok(BASE64.decode(payload.as_bytes())?)
}

/// Walks the packet stream, honoring both header formats.
///
/// New-format partial-body lengths are read as a single span of
/// `1 << (octet & 0x1f)` bytes; continuation parts are not chased, so a
/// very large partial-body packet truncates. Changing that would change
/// the bytes fed into stored fingerprints.
pub fn split_packets(data: &[u8]) -> Result<Vec<PgpPacket>, ParseError> {
    let mut packets = Vec::new();
    let mut pos = 0_usize;

    while pos < data.len() {
        let header = data[pos];
        pos += 1;

        if header & 0x80 == 0 {
            return Err(ParseError::Other(format!(
                "invalid packet header byte {header:#04x} at offset {}",
                pos - 1
            )));
        }

        let (tag, len) = if header & 0x40 != 0 {
            // New format: tag in the low six bits, then a variable
            // length encoding.
            let tag = header & 0x3f;
            let first = *data.get(pos).ok_or(ParseError::Truncated("packet length"))?;
            pos += 1;

            let len = match first {
                0..=191 => usize::from(first),
                192..=223 => {
                    let second =
                        *data.get(pos).ok_or(ParseError::Truncated("packet length"))?;
                    pos += 1;
                    (usize::from(first) - 192) * 256 + usize::from(second) + 192
                }
                255 => {
                    let bytes = data
                        .get(pos..pos + 4)
                        .ok_or(ParseError::Truncated("packet length"))?;
                    pos += 4;
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                // Partial body: single span.
                _ => 1_usize << (first & 0x1f),
            };

            (tag, len)
        } else {
            // Old format: tag in bits 2..6, length type in the low two.
            let tag = (header >> 2) & 0x0f;
            let len = match header & 0x03 {
                0 => {
                    let byte = *data.get(pos).ok_or(ParseError::Truncated("packet length"))?;
                    pos += 1;
                    usize::from(byte)
                }
                1 => {
                    let bytes = data
                        .get(pos..pos + 2)
                        .ok_or(ParseError::Truncated("packet length"))?;
                    pos += 2;
                    usize::from(u16::from_be_bytes([bytes[0], bytes[1]]))
                }
                2 => {
                    let bytes = data
                        .get(pos..pos + 4)
                        .ok_or(ParseError::Truncated("packet length"))?;
                    pos += 4;
                    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
                }
                // Indeterminate: rest of the buffer.
                _ => data.len() - pos,
            };

            (tag, len)
        };

        // Partial-body spans may promise more than the stream holds.
        let end = (pos + len).min(data.len());
        packets.push(PgpPacket {
            tag,
            body: data[pos..end].to_vec(),
        });
        pos = end;
    }

    Ok(packets)
}

/// Parses a version-4 Public-Key or Public-Subkey packet body.
pub fn parse_public_key_packet(body: &[u8]) -> Result<PgpPublicKey, ParseError> {
    if body.len() < 6 {
        return Err(ParseError::Truncated("public key packet"));
    }

    let version = body[0];
    if version != 4 {
        return Err(ParseError::Other(format!(
            "unsupported public key packet version {version}"
        )));
    }

    let created_secs = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    let algorithm_id = body[5];

    let algorithm = match algorithm_id {
        1 => "RSA".to_owned(),
        17 => "DSA".to_owned(),
        18 => "ECDH".to_owned(),
        19 => "ECDSA".to_owned(),
        22 => "EdDSA".to_owned(),
        other => format!("unknown({other})"),
    };

    let bits = match algorithm_id {
        // RSA and DSA lead with an MPI whose 16-bit prefix is the
        // magnitude's bit count.
        1 | 17 => body
            .get(6..8)
            .map(|bytes| u32::from(u16::from_be_bytes([bytes[0], bytes[1]])))
            .unwrap_or(0),
        18 | 19 | 22 => 256,
        _ => 0,
    };

    let (fingerprint, fingerprint_sha1) = framed_fingerprints(body);
    let key_id = fingerprint[fingerprint.len() - 16..].to_owned();

    Ok(PgpPublicKey {
        created: Utc.timestamp_opt(i64::from(created_secs), 0).single(),
        algorithm,
        bits,
        fingerprint,
        fingerprint_sha1,
        key_id,
    })
}

/// Fingerprints over `0x99 || u16be(len) || body`: the legacy SHA-256
/// value first, the RFC 4880 SHA-1 second.
#[must_use]
pub fn framed_fingerprints(body: &[u8]) -> (String, String) {
    let len = body.len() as u16;
    let frame_prefix = [0x99, (len >> 8) as u8, (len & 0xff) as u8];

    let mut sha256 = Sha256::new();
    sha256.update(frame_prefix);
    sha256.update(body);

    let mut sha1 = Sha1::new();
    sha1.update(frame_prefix);
    sha1.update(body);

    (hex::encode(sha256.finalize()), hex::encode(sha1.finalize()))
}

/// Splits `"Name (Comment) <email@host>"` into name and email. Either
/// part may come back empty.
#[must_use]
pub fn parse_user_id(uid: &str) -> (String, String) {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    let email_re = EMAIL.get_or_init(|| Regex::new(r"<([^>]+)>").expect("static regex"));

    let email = email_re
        .captures(uid)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_owned())
        .unwrap_or_default();

    let name_end = uid.find(['<', '(']).unwrap_or(uid.len());
    let name = uid[..name_end].trim().to_owned();

    (name, email)
}

/// Reduces an armored public key block to the signer identity.
pub fn parse_key_block(armored: &str) -> Result<PgpKeyBlockInfo, ParseError> {
    let data = strip_armor(armored)?;
    let packets = split_packets(&data)?;

    let mut info = PgpKeyBlockInfo::default();

    for packet in packets {
        match packet.tag {
            TAG_PUBLIC_KEY if info.primary.is_none() => {
                info.primary = Some(parse_public_key_packet(&packet.body)?);
            }
            TAG_PUBLIC_SUBKEY => match parse_public_key_packet(&packet.body) {
                Ok(subkey) => info.subkeys.push(subkey),
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unparseable subkey packet");
                }
            },
            TAG_USER_ID if info.primary_user_id.is_none() => {
                info.primary_user_id =
                    Some(String::from_utf8_lossy(&packet.body).into_owned());
            }
            _ => {}
        }
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// v4 RSA public key packet body with the given MPI bit count.
    fn rsa_key_body(created: u32, bits: u16) -> Vec<u8> {
        let mut body = vec![4];
        body.extend_from_slice(&created.to_be_bytes());
        body.push(1); // RSA
        body.extend_from_slice(&bits.to_be_bytes());
        // Truncated MPI payload is fine; sizing only reads the prefix.
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        body
    }

    fn old_format_packet(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x80 | (tag << 2) | 0x01];
        packet.extend_from_slice(&(body.len() as u16).to_be_bytes());
        packet.extend_from_slice(body);
        packet
    }

    fn new_format_packet(tag: u8, body: &[u8]) -> Vec<u8> {
        assert!(body.len() < 192);
        let mut packet = vec![0xc0 | tag, body.len() as u8];
        packet.extend_from_slice(body);
        packet
    }

    fn armor(data: &[u8]) -> String {
        let payload = BASE64.encode(data);
        format!(
            "-----BEGIN PGP PUBLIC KEY BLOCK-----\n\
             Version: GnuPG v1\n\
             Comment: test fixture\n\
             \n\
             {payload}\n\
             =abcd\n\
             -----END PGP PUBLIC KEY BLOCK-----\n"
        )
    }

    #[test]
    fn old_and_new_framing_agree() {
        let body = rsa_key_body(1_600_000_000, 2048);

        let old = split_packets(&old_format_packet(TAG_PUBLIC_KEY, &body)).unwrap();
        let new = split_packets(&new_format_packet(TAG_PUBLIC_KEY, &body)).unwrap();

        assert_eq!(old, new);
        assert_eq!(old[0].tag, TAG_PUBLIC_KEY);
        assert_eq!(old[0].body, body);
    }

    #[test]
    fn two_byte_new_format_length() {
        let body = vec![0x55_u8; 300];
        let mut packet = vec![0xc0 | TAG_USER_ID];
        // 300 = (first - 192) * 256 + second + 192
        packet.push(192);
        packet.push((300 - 192) as u8);
        packet.extend_from_slice(&body);

        let packets = split_packets(&packet).unwrap();
        assert_eq!(packets[0].body.len(), 300);
    }

    #[test]
    fn partial_body_is_a_single_span() {
        // 230 => span of 1 << 6 = 64 bytes, clamped to what the stream
        // actually holds.
        let mut packet = vec![0xc0 | TAG_USER_ID, 230];
        packet.extend_from_slice(&[0x41; 10]);

        let packets = split_packets(&packet).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].body, vec![0x41; 10]);
    }

    #[test]
    fn indeterminate_old_length_takes_the_rest() {
        let mut packet = vec![0x80 | (TAG_PUBLIC_KEY << 2) | 0x03];
        packet.extend_from_slice(b"tail bytes");

        let packets = split_packets(&packet).unwrap();
        assert_eq!(packets[0].body, b"tail bytes");
    }

    #[test]
    fn key_packet_identity_is_stable() {
        let body = rsa_key_body(1_600_000_000, 2048);
        let key = parse_public_key_packet(&body).unwrap();

        assert_eq!(key.algorithm, "RSA");
        assert_eq!(key.bits, 2048);
        assert_eq!(key.created.unwrap().timestamp(), 1_600_000_000);

        // Independent re-derivation of the framed digests.
        let mut framed = vec![0x99, 0, body.len() as u8];
        framed.extend_from_slice(&body);
        assert_eq!(key.fingerprint, hex::encode(Sha256::digest(&framed)));
        assert_eq!(key.fingerprint_sha1, hex::encode(Sha1::digest(&framed)));

        assert_eq!(key.key_id.len(), 16);
        assert!(key.fingerprint.ends_with(&key.key_id));
    }

    #[test]
    fn non_v4_keys_are_rejected() {
        let mut body = rsa_key_body(0, 1024);
        body[0] = 3;

        assert!(parse_public_key_packet(&body).is_err());
    }

    #[test]
    fn user_id_splits_name_comment_email() {
        let (name, email) = parse_user_id("Devuan Repository (Master) <repository@devuan.org>");
        assert_eq!(name, "Devuan Repository");
        assert_eq!(email, "repository@devuan.org");

        let (name, email) = parse_user_id("no email here");
        assert_eq!(name, "no email here");
        assert_eq!(email, "");

        let (name, email) = parse_user_id("<just@mail>");
        assert_eq!(name, "");
        assert_eq!(email, "just@mail");
    }

    #[test]
    fn key_block_recovers_signer_identity() {
        let primary = rsa_key_body(1_500_000_000, 4096);
        let subkey = {
            let mut body = vec![4];
            body.extend_from_slice(&1_500_000_100_u32.to_be_bytes());
            body.push(19); // ECDSA
            body.extend_from_slice(&[0x01, 0x02]);
            body
        };

        let mut stream = Vec::new();
        stream.extend_from_slice(&old_format_packet(TAG_PUBLIC_KEY, &primary));
        stream.extend_from_slice(&new_format_packet(
            TAG_USER_ID,
            b"Devuan Repository <repository@devuan.org>",
        ));
        stream.extend_from_slice(&new_format_packet(TAG_PUBLIC_SUBKEY, &subkey));

        let info = parse_key_block(&armor(&stream)).unwrap();

        let key = info.primary.unwrap();
        assert_eq!(key.algorithm, "RSA");
        assert_eq!(key.bits, 4096);

        assert_eq!(info.subkeys.len(), 1);
        assert_eq!(info.subkeys[0].algorithm, "ECDSA");
        assert_eq!(info.subkeys[0].bits, 256);

        let (name, email) = parse_user_id(info.primary_user_id.as_deref().unwrap());
        assert_eq!(name, "Devuan Repository");
        assert_eq!(email, "repository@devuan.org");
    }
}
