//! Macros and parsing helpers for the two ID families.
//!
//! Node-assigned IDs are ULIDs wearing a kind prefix, `{prefix}_{ulid}`.
//! The prefix is load-bearing: instance IDs become supervisor unit name
//! stems, so a mixed-up kind must fail parsing loudly rather than produce
//! a plausible-looking unit name. Parsing therefore distinguishes "this is
//! a valid ID of another kind" from "this is not an ID at all".

use ulid::Ulid;

use crate::IdError;

/// Every prefix minted by this node. Kept in sync with the `define_id!`
/// invocations in `types.rs`; parsing uses it to recognize an ID of the
/// wrong kind.
pub const NODE_ID_PREFIXES: &[&str] = &["inst", "node"];

/// Splits a canonical `{prefix}_{ulid}` value, checking the prefix against
/// the expected kind and the registry of known kinds.
pub fn parse_prefixed(value: &str, expected: &'static str) -> Result<Ulid, IdError> {
    if value.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, raw)) = value.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        if let Some(actual) = NODE_ID_PREFIXES.iter().copied().find(|p| *p == prefix) {
            return Err(IdError::WrongKind { expected, actual });
        }
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    raw.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}

/// Defines a node-assigned ID kind.
///
/// The generated type keeps only what the service manager needs: minting,
/// kind-checked parsing, the canonical display form, and serde support
/// that round-trips the canonical string. `Debug` renders the canonical
/// form too, so an ID in a log line is always copy-pasteable.
#[macro_export]
macro_rules! define_id {
    ($(#[$docs:meta])* $name:ident => $prefix:literal) => {
        $(#[$docs])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            /// Canonical prefix of this ID kind.
            pub const PREFIX: &'static str = $prefix;

            /// Mints a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            /// Parses the canonical form, rejecting IDs of other kinds.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                $crate::parse_prefixed(s, Self::PREFIX).map(Self)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Defines a cloud-assigned ID: a validated newtype over `String`.
///
/// The cloud owns the content; the node only checks that the value is
/// non-empty, within the length limit, and restricted to
/// `[A-Za-z0-9._-]` so it can be embedded in unit names and file paths.
#[macro_export]
macro_rules! define_cloud_id {
    ($name:ident, $kind:literal) => {
        /// An opaque identifier assigned by the cloud.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Maximum accepted length in bytes.
            pub const MAX_LEN: usize = 128;

            /// Validates and wraps a cloud identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, $crate::IdError> {
                let value = value.into();

                if value.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                if value.len() > Self::MAX_LEN {
                    return Err($crate::IdError::InvalidCloudId {
                        kind: $kind,
                        message: format!("longer than {} bytes", Self::MAX_LEN),
                    });
                }

                if let Some(bad) = value
                    .chars()
                    .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
                {
                    return Err($crate::IdError::InvalidCloudId {
                        kind: $kind,
                        message: format!("character {bad:?} is not allowed"),
                    });
                }

                Ok(Self(value))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::new(s).map_err(serde::de::Error::custom)
            }
        }
    };
}
