//! Strongly-typed identifiers used across the domain.
//!
//! The server hands out identifiers as either JSON strings or integers
//! depending on the endpoint. Text identifiers accept both, compare by their
//! text form, and serialize back in the shape they arrived in.

use core::str::FromStr;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::DomainError;

/// Wire representation accepted for identifiers.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
    UInt(u64),
}

/// JSON scalar kind an identifier arrived as; serialization writes the same kind back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wire {
    Text,
    Number,
}

/// Caller-assigned key of a queued outbox record (idempotency token).
#[derive(Debug, Clone)]
pub struct UniqueId {
    text: String,
    wire: Wire,
}

/// Identifier of a store (shop) a till belongs to.
#[derive(Debug, Clone)]
pub struct StoreId {
    text: String,
    wire: Wire,
}

/// Identifier of a user (actor identity).
#[derive(Debug, Clone)]
pub struct UserId {
    text: String,
    wire: Wire,
}

macro_rules! impl_text_id {
    ($t:ident, $name:literal) => {
        impl $t {
            /// Build an identifier, rejecting empty or whitespace-only values.
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let text = value.into();
                if text.trim().is_empty() {
                    return Err(DomainError::invalid_id(concat!($name, ": empty")));
                }
                Ok(Self { text, wire: Wire::Text })
            }

            /// Build an identifier the server sent as a JSON number.
            pub fn from_number(value: i64) -> Self {
                Self {
                    text: value.to_string(),
                    wire: Wire::Number,
                }
            }

            pub fn as_str(&self) -> &str {
                &self.text
            }

            fn from_raw(raw: RawId) -> Result<Self, DomainError> {
                match raw {
                    RawId::Text(s) => Self::new(s),
                    RawId::Int(n) => Ok(Self::from_number(n)),
                    RawId::UInt(n) => Ok(Self {
                        text: n.to_string(),
                        wire: Wire::Number,
                    }),
                }
            }
        }

        // `9` and `"9"` name the same id.
        impl PartialEq for $t {
            fn eq(&self, other: &Self) -> bool {
                self.text == other.text
            }
        }

        impl Eq for $t {}

        impl core::hash::Hash for $t {
            fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
                self.text.hash(state);
            }
        }

        impl PartialOrd for $t {
            fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $t {
            fn cmp(&self, other: &Self) -> core::cmp::Ordering {
                self.text.cmp(&other.text)
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.text)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.text
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl Serialize for $t {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if self.wire == Wire::Number {
                    if let Ok(n) = self.text.parse::<i64>() {
                        return serializer.serialize_i64(n);
                    }
                    if let Ok(n) = self.text.parse::<u64>() {
                        return serializer.serialize_u64(n);
                    }
                }
                serializer.serialize_str(&self.text)
            }
        }

        impl<'de> Deserialize<'de> for $t {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                Self::from_raw(RawId::deserialize(deserializer)?).map_err(de::Error::custom)
            }
        }
    };
}

impl_text_id!(UniqueId, "UniqueId");
impl_text_id!(StoreId, "StoreId");
impl_text_id!(UserId, "UserId");

/// Stock identity of a catalog product (`SID`), stable across fetches.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StockId(i64);

impl StockId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for StockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for StockId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Self)
            .map_err(|e| DomainError::invalid_id(format!("StockId '{s}': {e}")))
    }
}

impl<'de> Deserialize<'de> for StockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawId::deserialize(deserializer)? {
            RawId::Int(n) => Ok(Self(n)),
            RawId::UInt(n) => i64::try_from(n)
                .map(Self)
                .map_err(|_| de::Error::custom(format!("StockId {n} out of range"))),
            RawId::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}
