//! Ownership gate: who may view or mutate an application.
//!
//! A caller other than the owner needs ≥ read for view operations and
//! ≥ write for mutating operations. Which of the two permission fields
//! applies is selected by whether the caller shares the owner's group.
//!
//! Wire encoding is a two-digit decimal: tens digit = group field, units
//! digit = other field, each digit ∈ {1 deny, 2 read, 3 write}. Default 11.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// One permission field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    Deny = 1,
    Read = 2,
    Write = 3,
}

impl Access {
    fn from_digit(d: u8) -> Option<Self> {
        match d {
            1 => Some(Access::Deny),
            2 => Some(Access::Read),
            3 => Some(Access::Write),
            _ => None,
        }
    }
}

/// How the caller relates to the application's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// The caller is the owner.
    Owner,
    /// The caller shares the owner's group.
    Group,
    /// Neither owner nor group member.
    Other,
}

/// The two non-owner permission fields of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerPermission {
    pub group: Access,
    pub other: Access,
}

impl Default for OwnerPermission {
    fn default() -> Self {
        Self {
            group: Access::Deny,
            other: Access::Deny,
        }
    }
}

impl OwnerPermission {
    /// True when `relation` grants the requested level.
    ///
    /// The owner always passes; this gate only constrains everyone else.
    pub fn allows(&self, relation: Relation, write: bool) -> bool {
        let needed = if write { Access::Write } else { Access::Read };
        match relation {
            Relation::Owner => true,
            Relation::Group => self.group >= needed,
            Relation::Other => self.other >= needed,
        }
    }

    fn to_wire(self) -> u8 {
        (self.group as u8) * 10 + self.other as u8
    }

    fn from_wire(v: u64) -> Option<Self> {
        if !(11..=33).contains(&v) {
            return None;
        }
        Some(Self {
            group: Access::from_digit((v / 10) as u8)?,
            other: Access::from_digit((v % 10) as u8)?,
        })
    }
}

impl Serialize for OwnerPermission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.to_wire())
    }
}

impl<'de> Deserialize<'de> for OwnerPermission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u64::deserialize(deserializer)?;
        OwnerPermission::from_wire(v).ok_or_else(|| {
            de::Error::custom(format!(
                "owner_permission must be two digits of 1..=3, got {v}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        for wire in [11u64, 12, 13, 21, 22, 23, 31, 32, 33] {
            let p = OwnerPermission::from_wire(wire).unwrap();
            assert_eq!(p.to_wire() as u64, wire);
        }
        for bad in [0u64, 10, 14, 41, 34, 111] {
            assert!(OwnerPermission::from_wire(bad).is_none(), "{bad}");
        }
    }

    #[test]
    fn owner_always_allowed() {
        let p = OwnerPermission::default();
        assert!(p.allows(Relation::Owner, true));
        assert!(p.allows(Relation::Owner, false));
    }

    #[test]
    fn group_and_other_levels() {
        // group=read, other=deny
        let p = OwnerPermission::from_wire(21).unwrap();
        assert!(p.allows(Relation::Group, false));
        assert!(!p.allows(Relation::Group, true));
        assert!(!p.allows(Relation::Other, false));

        // group=write, other=read
        let p = OwnerPermission::from_wire(32).unwrap();
        assert!(p.allows(Relation::Group, true));
        assert!(p.allows(Relation::Other, false));
        assert!(!p.allows(Relation::Other, true));
    }

    #[test]
    fn serde_uses_two_digit_integer() {
        let p: OwnerPermission = serde_json::from_str("23").unwrap();
        assert_eq!(p.group, Access::Read);
        assert_eq!(p.other, Access::Write);
        assert_eq!(serde_json::to_string(&p).unwrap(), "23");
        assert!(serde_json::from_str::<OwnerPermission>("44").is_err());
    }
}
