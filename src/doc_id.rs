use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Minimum number of digits in a rendered record ID.
pub const RECORD_ID_WIDTH: usize = 4;

/// A stable, sequential record identifier.
///
/// IDs are assigned once from the knowledge base's monotonically increasing
/// counter and never reused, so `0002` keeps meaning the same document even
/// after `0001` is deleted. Rendered zero-padded to [`RECORD_ID_WIDTH`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u64);

impl RecordId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The ID following this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = RECORD_ID_WIDTH)
    }
}

impl FromStr for RecordId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('#').unwrap_or(s);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("invalid record id: {s:?}"));
        }
        digits
            .parse()
            .map(Self)
            .map_err(|e| format!("invalid record id {s:?}: {e}"))
    }
}

// Serialized in the rendered, zero-padded form so metadata and checkpoint
// files stay human-readable and sort the same way the CLI prints them.
impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_zero_padded() {
        assert_eq!(RecordId::new(1).to_string(), "0001");
        assert_eq!(RecordId::new(42).to_string(), "0042");
    }

    #[test]
    fn display_grows_past_width() {
        assert_eq!(RecordId::new(123_456).to_string(), "123456");
    }

    #[test]
    fn parse_accepts_padding_and_hash_prefix() {
        assert_eq!("0003".parse::<RecordId>().unwrap(), RecordId::new(3));
        assert_eq!("#0003".parse::<RecordId>().unwrap(), RecordId::new(3));
        assert_eq!("17".parse::<RecordId>().unwrap(), RecordId::new(17));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<RecordId>().is_err());
        assert!("abc".parse::<RecordId>().is_err());
        assert!("-1".parse::<RecordId>().is_err());
    }

    #[test]
    fn next_increments() {
        assert_eq!(RecordId::new(3).next(), RecordId::new(4));
    }

    #[test]
    fn serializes_as_padded_string() {
        let json = serde_json::to_string(&RecordId::new(7)).unwrap();
        assert_eq!(json, "\"0007\"");
        let back: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RecordId::new(7));
    }

    #[test]
    fn ordering_is_numeric() {
        let mut ids = vec![RecordId::new(10), RecordId::new(2), RecordId::new(1)];
        ids.sort();
        assert_eq!(ids, vec![RecordId::new(1), RecordId::new(2), RecordId::new(10)]);
    }
}
