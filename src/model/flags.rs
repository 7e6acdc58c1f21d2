use serde::{Serialize, Serializer};
use std::ops::{BitOr, BitOrAssign};

use crate::error::{FlagScope, UnknownFlagError};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident, $scope:expr, { $($(#[$flag_meta:meta])* $flag:ident = $bits:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$flag_meta])* pub const $flag: Self = Self($bits);)*

            const NAMED: &'static [(&'static str, Self)] = &[$((stringify!($flag), Self::$flag),)*];

            /// Looks up a flag by its registry name, e.g. `"SKIP_UNMATCHED_DST"`.
            pub fn from_name(name: &str) -> Result<Self, UnknownFlagError> {
                Self::NAMED
                    .iter()
                    .find(|(flag, _)| *flag == name)
                    .map(|(_, value)| *value)
                    .ok_or_else(|| UnknownFlagError {
                        scope: $scope,
                        name: name.to_string(),
                    })
            }

            /// Union of the named flags; the first unknown name is an error.
            pub fn from_names<I, S>(names: I) -> Result<Self, UnknownFlagError>
            where
                I: IntoIterator<Item = S>,
                S: AsRef<str>,
            {
                names
                    .into_iter()
                    .try_fold(Self::NONE, |acc, name| Ok(acc | Self::from_name(name.as_ref())?))
            }

            pub fn bits(self) -> u32 {
                self.0
            }

            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True when every bit of `other` is set.
            pub fn contains(self, other: Self) -> bool {
                !other.is_empty() && self.0 & other.0 == other.0
            }

            pub fn insert(&mut self, other: Self) {
                self.0 |= other.0;
            }

            /// Names of the single-bit flags that are set.
            pub fn names(self) -> Vec<&'static str> {
                Self::NAMED
                    .iter()
                    .filter(|(_, value)| value.0.count_ones() == 1 && self.contains(*value))
                    .map(|(name, _)| *name)
                    .collect()
            }
        }

        impl BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.names().serialize(serializer)
            }
        }
    };
}

flag_set!(
    /// Run-wide switches.
    GlobalFlags, FlagScope::Global, {
        /// Keep going with children of an entity whose create failed.
        CONTINUE_ON_FAILURE = 0b0001,
        SKIP_UNMATCHED_SRC = 0b0010,
        SKIP_UNMATCHED_DST = 0b0100,
        SKIP_UNMATCHED_BOTH = 0b0110,
        /// Emit a log entry for entities that did not change.
        LOG_UNCHANGED_RECORDS = 0b1000,
    }
);

flag_set!(
    /// Per-type or per-entity switches, also reachable through record tags.
    ModelFlags, FlagScope::Model, {
        /// The entity and its subtree take no part in the diff.
        IGNORE = 0b00001,
        /// Deleting an entity does not queue deletes for its children.
        SKIP_CHILDREN_ON_DELETE = 0b00010,
        SKIP_UNMATCHED_SRC = 0b00100,
        SKIP_UNMATCHED_DST = 0b01000,
        SKIP_UNMATCHED_BOTH = 0b01100,
        /// Delete in dependency order instead of reverse dependency order.
        NATURAL_DELETION_ORDER = 0b10000,
    }
);
