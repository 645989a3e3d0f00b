//! String-backed identifiers for aggregate and event types.
//!
//! Event types use the dotted `<aggregate>.<subject>.<verb>` form found in the
//! event log (`org.member.added`, `instance.removed`). The set is open: each
//! domain crate brings its own, so these are newtypes rather than an enum.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

string_type!(
    /// Kind of aggregate an event belongs to (`org`, `instance`, `user`).
    AggregateType
);

string_type!(
    /// Fully-qualified event type (`org.member.added`).
    EventType
);
