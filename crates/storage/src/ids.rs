use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Stable identifier for one chat entry, assigned by the log on first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-entry-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for EntryId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl FromStr for EntryId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_display_and_parse() {
        let id = EntryId::new_v7();
        let reparsed = EntryId::parse(&id.to_string()).expect("display output must parse");
        assert_eq!(id, reparsed);
    }

    #[test]
    fn rejects_malformed_text() {
        let error = EntryId::parse("not-a-uuid").expect_err("garbage must not parse");
        assert!(matches!(error, StorageError::InvalidId { .. }));
    }
}
