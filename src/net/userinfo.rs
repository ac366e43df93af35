//! Backslash-delimited info strings (`\key\value\key\value`)

use std::fmt;

/// Longest info string accepted from a client
pub const MAX_INFO_STRING: usize = 1024;

/// Longest player name kept after sanitising
pub const MAX_NAME_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InfoError {
    #[error("Info string too long ({0} bytes)")]
    TooLong(usize),
    #[error("Info string contains forbidden character {0:?}")]
    ForbiddenChar(char),
    #[error("Info string key without value")]
    MissingValue,
}

/// Parsed info string, keys in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoString {
    pairs: Vec<(String, String)>,
}

fn check_token(token: &str) -> Result<(), InfoError> {
    match token.chars().find(|c| matches!(c, '\\' | ';' | '"') || c.is_control()) {
        Some(c) => Err(InfoError::ForbiddenChar(c)),
        None => Ok(()),
    }
}

impl InfoString {
    pub fn parse(raw: &str) -> Result<Self, InfoError> {
        if raw.len() > MAX_INFO_STRING {
            return Err(InfoError::TooLong(raw.len()));
        }
        if let Some(c) = raw.chars().find(|c| matches!(c, ';' | '"') || c.is_control()) {
            return Err(InfoError::ForbiddenChar(c));
        }

        let mut info = Self::default();
        let body = raw.strip_prefix('\\').unwrap_or(raw);
        if body.is_empty() {
            return Ok(info);
        }

        let mut parts = body.split('\\');
        while let Some(key) = parts.next() {
            let value = parts.next().ok_or(InfoError::MissingValue)?;
            if !key.is_empty() {
                info.set(key, value)?;
            }
        }
        Ok(info)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Insert or replace a key; an empty value removes it
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), InfoError> {
        check_token(key)?;
        check_token(value)?;

        let mut pairs: Vec<(String, String)> = self
            .pairs
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(key))
            .cloned()
            .collect();
        if !value.is_empty() {
            pairs.push((key.to_string(), value.to_string()));
        }

        let candidate = InfoString { pairs };
        let len = candidate.to_string().len();
        if len > MAX_INFO_STRING {
            return Err(InfoError::TooLong(len));
        }
        *self = candidate;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for InfoString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.pairs {
            write!(f, "\\{}\\{}", key, value)?;
        }
        Ok(())
    }
}

/// Printable ASCII only, trimmed and length-limited
pub fn sanitize_name(raw: &str) -> String {
    let name: String = raw
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(MAX_NAME_LENGTH)
        .collect();
    let name = name.trim();
    if name.is_empty() {
        "player".to_string()
    } else {
        name.to_string()
    }
}

/// Bandwidth requested by the client, clamped to the server bounds
pub fn client_rate(info: &InfoString, min: u32, max: u32, default: u32) -> u32 {
    info.get("rate")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}

/// Milliseconds between snapshots for the requested `snaps`, never faster
/// than the server ticks
pub fn snapshot_interval(info: &InfoString, default_snaps: u32, tick_rate: u32) -> u64 {
    let snaps = info
        .get("snaps")
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default_snaps)
        .clamp(1, tick_rate.max(1));
    1000 / snaps as u64
}
