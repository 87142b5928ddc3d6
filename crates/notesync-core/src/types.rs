//! Strong type definitions for Notesync.
//!
//! All identifiers are string newtypes so a user id can never be passed
//! where a row id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw string.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the raw string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Client-generated row identifier, unique within its table and
    /// stable across devices.
    RowId
}

string_id! {
    /// Owner of a row.
    UserId
}

string_id! {
    /// Per-profile device identity. Recorded as `updated_by` for
    /// provenance; never used to break merge ties.
    DeviceId
}

string_id! {
    /// A set of tables pulled together under one cursor.
    ModuleGroup
}

impl RowId {
    /// Generate a random row id.
    pub fn random() -> Self {
        Self(random_hex())
    }
}

impl DeviceId {
    /// Generate a random device id.
    pub fn random() -> Self {
        Self(random_hex())
    }
}

fn random_hex() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
