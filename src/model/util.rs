//! Serde helpers for Discord's wire quirks.

use serde::{Deserialize, Deserializer, Serializer};

/// Snowflakes arrive as either JSON strings or integers; we emit strings.
pub mod snowflake {
    use super::*;

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw<'a> {
            Int(u64),
            Str(&'a str),
            String(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(v) => Ok(v),
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::String(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// [`snowflake`], lifted over `Option`.
pub mod snowflake_opt {
    use super::*;

    pub fn serialize<S: Serializer>(id: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(v) => serializer.collect_str(v),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        #[derive(Deserialize)]
        struct Wrap(#[serde(with = "super::snowflake")] u64);

        Ok(Option::<Wrap>::deserialize(deserializer)?.map(|w| w.0))
    }
}
