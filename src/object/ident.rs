//! Author/committer/tagger identity lines.
//!
//! The serialized form is `name <email> timestamp zone`, where `zone` is a
//! signed `±HHMM` offset. Names and emails may contain spaces; the parser
//! anchors on the angle brackets and takes the two trailing fields, which
//! tolerates historical commits with unusual name content.

use std::fmt;

use memchr::{memchr, memrchr};

/// Errors from identity parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum IdentError {
    /// Missing or unbalanced angle brackets.
    Brackets,
    /// Timestamp field is absent or non-numeric.
    Timestamp,
    /// Zone field is absent or malformed.
    Zone,
}

impl fmt::Display for IdentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Brackets => write!(f, "identity missing <email> brackets"),
            Self::Timestamp => write!(f, "identity has bad timestamp"),
            Self::Zone => write!(f, "identity has bad time zone"),
        }
    }
}

impl std::error::Error for IdentError {}

/// A parsed identity with epoch timestamp and zone offset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersonIdent {
    /// Display name, possibly empty.
    pub name: String,
    /// Email address without brackets.
    pub email: String,
    /// Seconds since the Unix epoch.
    pub when: i64,
    /// Zone offset in minutes east of UTC.
    pub tz_minutes: i16,
}

impl PersonIdent {
    /// Creates an identity.
    #[must_use]
    pub fn new(name: &str, email: &str, when: i64, tz_minutes: i16) -> Self {
        Self {
            name: name.to_owned(),
            email: email.to_owned(),
            when,
            tz_minutes,
        }
    }

    /// Parses the serialized form `name <email> timestamp zone`.
    pub fn parse(line: &[u8]) -> Result<Self, IdentError> {
        let lt = memchr(b'<', line).ok_or(IdentError::Brackets)?;
        let gt = memrchr(b'>', line).ok_or(IdentError::Brackets)?;
        if gt < lt {
            return Err(IdentError::Brackets);
        }

        let name = String::from_utf8_lossy(line[..lt].strip_suffix(b" ").unwrap_or(&line[..lt]))
            .into_owned();
        let email = String::from_utf8_lossy(&line[lt + 1..gt]).into_owned();

        let tail = line[gt + 1..].strip_prefix(b" ").unwrap_or(&line[gt + 1..]);
        let space = memrchr(b' ', tail).ok_or(IdentError::Timestamp)?;
        let when = parse_i64(&tail[..space]).ok_or(IdentError::Timestamp)?;
        let tz_minutes = parse_zone(&tail[space + 1..]).ok_or(IdentError::Zone)?;

        Ok(Self {
            name,
            email,
            when,
            tz_minutes,
        })
    }

    /// Appends the serialized form to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(b" <");
        out.extend_from_slice(self.email.as_bytes());
        out.extend_from_slice(b"> ");
        out.extend_from_slice(self.when.to_string().as_bytes());
        out.push(b' ');
        let sign = if self.tz_minutes < 0 { b'-' } else { b'+' };
        let abs = self.tz_minutes.unsigned_abs();
        out.push(sign);
        out.extend_from_slice(format!("{:02}{:02}", abs / 60, abs % 60).as_bytes());
    }
}

impl fmt::Display for PersonIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        f.write_str(&String::from_utf8_lossy(&buf))
    }
}

fn parse_i64(field: &[u8]) -> Option<i64> {
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn parse_zone(field: &[u8]) -> Option<i16> {
    if field.len() != 5 {
        return None;
    }
    let sign: i16 = match field[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let digits = std::str::from_utf8(&field[1..]).ok()?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i16 = digits[..2].parse().ok()?;
    let minutes: i16 = digits[2..].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        let line = b"A U Thor <author@example.com> 1234567890 -0700";
        let ident = PersonIdent::parse(line).unwrap();
        assert_eq!(ident.name, "A U Thor");
        assert_eq!(ident.email, "author@example.com");
        assert_eq!(ident.when, 1234567890);
        assert_eq!(ident.tz_minutes, -420);

        let mut out = Vec::new();
        ident.write_to(&mut out);
        assert_eq!(out, line);
    }

    #[test]
    fn parse_empty_name() {
        let ident = PersonIdent::parse(b"<a@b> 0 +0000").unwrap();
        assert_eq!(ident.name, "");
        assert_eq!(ident.email, "a@b");
        assert_eq!(ident.tz_minutes, 0);
    }

    #[test]
    fn parse_name_with_angle_noise_uses_last_gt() {
        let ident = PersonIdent::parse(b"odd <a<b@c> 5 +0130").unwrap();
        assert_eq!(ident.email, "a<b@c");
        assert_eq!(ident.tz_minutes, 90);
    }

    #[test]
    fn rejects_missing_brackets() {
        assert_eq!(
            PersonIdent::parse(b"nobody 0 +0000"),
            Err(IdentError::Brackets)
        );
    }

    #[test]
    fn rejects_bad_zone() {
        assert_eq!(
            PersonIdent::parse(b"x <y@z> 0 0000"),
            Err(IdentError::Zone)
        );
        assert_eq!(
            PersonIdent::parse(b"x <y@z> 0 +00a0"),
            Err(IdentError::Zone)
        );
    }

    #[test]
    fn negative_epoch_allowed() {
        let ident = PersonIdent::parse(b"x <y@z> -42 +0000").unwrap();
        assert_eq!(ident.when, -42);
    }
}
