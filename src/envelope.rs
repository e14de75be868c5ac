//! Framing of the bytes in the key or value of a kafka record. A framed message starts with a
//! zero, the next 4 bytes are the big endian schema id. By default those are followed by one
//! byte with the length of the subject and the subject itself. The remaining bytes are the
//! encoded payload.
use std::borrow::Cow;

use byteorder::{BigEndian, ByteOrder};
use serde::Deserialize;

use crate::error::{ErrorKind, SRCError};

pub const MAGIC_BYTE: u8 = 0;
/// The length of the subject is written in a single byte.
pub const MAX_SUBJECT_LEN: usize = u8::MAX as usize;

/// Which of the two envelope layouts is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeFormat {
    /// `[0x00][u32 id][u8 subject length][subject][payload]`
    #[default]
    WithSubject,
    /// `[0x00][u32 id][payload]`, compatible with the Confluent serializers.
    Plain,
}

impl EnvelopeFormat {
    pub fn min_len(self) -> usize {
        match self {
            EnvelopeFormat::WithSubject => 6,
            EnvelopeFormat::Plain => 5,
        }
    }
}

/// A parsed envelope, borrowing from the original bytes. Invalid UTF-8 in the subject is
/// replaced, so the subject is only owned in that case.
#[derive(Debug, PartialEq)]
pub struct Envelope<'a> {
    pub id: u32,
    pub subject: Option<Cow<'a, str>>,
    pub payload: &'a [u8],
}

/// Returns the length of the subject when it fits in the length byte.
pub fn check_subject_len(subject: &str) -> Result<usize, SRCError> {
    let subject_len = subject.len();
    if subject_len > MAX_SUBJECT_LEN {
        return Err(SRCError::non_retryable_without_cause(
            ErrorKind::SubjectTooLong,
            &format!(
                "subject of {} bytes is longer than {}",
                subject_len, MAX_SUBJECT_LEN
            ),
        ));
    }
    Ok(subject_len)
}

/// Creates payload that can be included as a key or value on a kafka record
pub fn write_envelope(
    id: u32,
    subject: Option<&str>,
    encoded_bytes: &[u8],
) -> Result<Vec<u8>, SRCError> {
    let subject_len = match subject {
        Some(s) => check_subject_len(s)?,
        None => 0,
    };
    let mut payload = Vec::with_capacity(6 + subject_len + encoded_bytes.len());
    payload.push(MAGIC_BYTE);
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, id);
    payload.extend_from_slice(&buf);
    if let Some(s) = subject {
        payload.push(subject_len as u8);
        payload.extend_from_slice(s.as_bytes());
    }
    payload.extend_from_slice(encoded_bytes);
    Ok(payload)
}

/// Checks the length and the magic byte, and reads the schema id. The subject isn't looked at,
/// so the id can be resolved before the rest of the framing is validated.
pub fn read_id(bytes: &[u8], format: EnvelopeFormat) -> Result<u32, SRCError> {
    let n = bytes.len();
    if n < format.min_len() {
        return Err(SRCError::non_retryable_without_cause(
            ErrorKind::TruncatedMessage,
            &format!(
                "message len: {}, shorter than {} bytes",
                n,
                format.min_len()
            ),
        ));
    }
    if bytes[0] != MAGIC_BYTE {
        return Err(SRCError::non_retryable_without_cause(
            ErrorKind::BadMagicByte,
            &format!("unknown magic byte {}", bytes[0]),
        ));
    }
    Ok(BigEndian::read_u32(&bytes[1..5]))
}

/// Analyses the bytes which are contained in the key or value of a kafka record. Only the framing
/// is checked, the payload is returned as is.
pub fn parse_envelope(bytes: &[u8], format: EnvelopeFormat) -> Result<Envelope<'_>, SRCError> {
    let id = read_id(bytes, format)?;
    match format {
        EnvelopeFormat::Plain => Ok(Envelope {
            id,
            subject: None,
            payload: &bytes[5..],
        }),
        EnvelopeFormat::WithSubject => {
            let subject_len = bytes[5] as usize;
            let remaining = bytes.len() - 6;
            if subject_len > remaining {
                return Err(SRCError::non_retryable_without_cause(
                    ErrorKind::TruncatedMessage,
                    &format!(
                        "subject len: {}, greater than remaining buffer: {}",
                        subject_len, remaining
                    ),
                ));
            }
            Ok(Envelope {
                id,
                subject: Some(String::from_utf8_lossy(&bytes[6..6 + subject_len])),
                payload: &bytes[6 + subject_len..],
            })
        }
    }
}
