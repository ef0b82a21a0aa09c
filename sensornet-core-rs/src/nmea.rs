//! NMEA-style sentence framing
//!
//! Sentences look like `$BODY*hh` where `hh` is the XOR of every byte of
//! `BODY` in hex. The `*hh` suffix is optional. Lines that do not start
//! with `$` are not NMEA and pass through unchanged.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NmeaError {
    #[error("bad checksum: sentence carries {carried:02x}, body computes to {computed:02x}")]
    BadChecksum { carried: u8, computed: u8 },

    #[error("unreadable checksum field [{0}]")]
    MalformedChecksum(String),
}

pub fn is_nmea(line: &str) -> bool {
    line.starts_with('$')
}

/// XOR of all bytes of a sentence body
pub fn checksum(body: &str) -> u8 {
    body.bytes().fold(0, |acc, b| acc ^ b)
}

/// Remove `$` and a verified `*hh` suffix from an NMEA sentence
pub fn strip_nmea(line: &str) -> Result<&str, NmeaError> {
    let Some(body) = line.strip_prefix('$') else {
        return Ok(line);
    };
    let bytes = body.as_bytes();
    if bytes.len() < 3 || bytes[bytes.len() - 3] != b'*' {
        return Ok(body);
    }
    let (bare, suffix) = body.split_at(bytes.len() - 3);
    let digits = &suffix[1..];
    let carried = u8::from_str_radix(digits, 16)
        .map_err(|_| NmeaError::MalformedChecksum(digits.to_string()))?;
    let computed = checksum(bare);
    if carried != computed {
        return Err(NmeaError::BadChecksum { carried, computed });
    }
    Ok(bare)
}

/// Frame a bare body as a sentence, optionally with checksum
pub fn make_nmea(body: &str, with_checksum: bool) -> String {
    if with_checksum {
        format!("${}*{:02x}", body, checksum(body))
    } else {
        format!("${}", body)
    }
}
