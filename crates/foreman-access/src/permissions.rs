use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Permission bits over {READ, WRITE, EXECUTE}.
///
/// Serializes as a list of flag names (`["read", "execute"]`) so grants
/// stay readable in logs and snapshots.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Permissions = Permissions(0);
    pub const READ: Permissions = Permissions(0b001);
    pub const WRITE: Permissions = Permissions(0b010);
    pub const EXECUTE: Permissions = Permissions(0b100);

    // Common combinations.
    pub const READ_ONLY: Permissions = Permissions(0b001);
    pub const WRITE_ONLY: Permissions = Permissions(0b010);
    pub const READ_WRITE: Permissions = Permissions(0b011);
    pub const READ_EXECUTE: Permissions = Permissions(0b101);
    pub const FULL: Permissions = Permissions(0b111);

    pub fn contains(self, required: Permissions) -> bool {
        self.0 & required.0 == required.0
    }

    #[must_use]
    pub fn union(self, other: Permissions) -> Permissions {
        Permissions(self.0 | other.0)
    }

    #[must_use]
    pub fn difference(self, other: Permissions) -> Permissions {
        Permissions(self.0 & !other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.contains(Permissions::READ) {
            names.push("read");
        }
        if self.contains(Permissions::WRITE) {
            names.push("write");
        }
        if self.contains(Permissions::EXECUTE) {
            names.push("execute");
        }
        names
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join("+"))
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Serialize for Permissions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let names = self.names();
        let mut seq = serializer.serialize_seq(Some(names.len()))?;
        for name in names {
            seq.serialize_element(name)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FlagVisitor;

        impl<'de> Visitor<'de> for FlagVisitor {
            type Value = Permissions;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of permission flag names")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Permissions, A::Error> {
                let mut perms = Permissions::NONE;
                while let Some(name) = seq.next_element::<String>()? {
                    perms = perms.union(match name.as_str() {
                        "read" => Permissions::READ,
                        "write" => Permissions::WRITE,
                        "execute" => Permissions::EXECUTE,
                        other => {
                            return Err(de::Error::custom(format!(
                                "unknown permission flag '{other}'"
                            )))
                        }
                    });
                }
                Ok(perms)
            }
        }

        deserializer.deserialize_seq(FlagVisitor)
    }
}
