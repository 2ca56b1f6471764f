use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

/// Identifier of one chat session.
///
/// Minted as UUID v7, so ids are unique and ordered by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
            stage: "parse-session-id",
            id_type: "session-id",
            raw: raw.to_string(),
        })?;
        Ok(Self(parsed))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

impl From<Uuid> for SessionId {
    fn from(value: Uuid) -> Self {
        Self::new(value)
    }
}

impl From<SessionId> for Uuid {
    fn from(value: SessionId) -> Self {
        value.0
    }
}

impl FromStr for SessionId {
    type Err = StorageError;

    fn from_str(raw: &str) -> StorageResult<Self> {
        Self::parse(raw)
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique() {
        let first = SessionId::new_v7();
        let second = SessionId::new_v7();

        assert_ne!(first, second);
        assert_eq!(first.as_uuid().get_version_num(), 7);
    }

    #[test]
    fn display_output_parses_back() {
        let id = SessionId::new_v7();
        let parsed: SessionId = id.to_string().parse().expect("id should parse");
        assert_eq!(parsed, id);
    }

    #[test]
    fn invalid_raw_id_is_rejected() {
        let error = SessionId::parse("1712345678901").expect_err("timestamp is not a uuid");
        assert!(matches!(error, StorageError::InvalidId { .. }));
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = SessionId::new_v7();
        let encoded = serde_json::to_string(&id).expect("serialize");
        assert_eq!(encoded, format!("\"{id}\""));

        let decoded: SessionId = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, id);
    }
}
