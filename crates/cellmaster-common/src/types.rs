//! Core type definitions for cellmaster
//!
//! This module defines the identifiers used throughout the master: object
//! ids and their embedded type/cell tags, versioned (branched) ids, leader
//! epochs and peer ids.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a master cell; embedded into every object id.
pub type CellId = u16;

/// Index of a replica within its cell.
pub type PeerId = u32;

/// Bit set in the type tag of schema object ids.
pub const SCHEMA_TYPE_MASK: u16 = 0x8000;

/// Token that prefixes an object id when it is addressed directly by path.
pub const OBJECT_ID_PATH_PREFIX: char = '#';

/// 128-bit object identifier.
///
/// Layout of the four 32-bit parts:
/// ```text
/// [0] random (or well-known hash)
/// [1] (cell_id << 16) | type
/// [2] low 32 bits of the creation counter (record count)
/// [3] high 32 bits of the creation counter (segment id)
/// ```
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ObjectId {
    parts: [u32; 4],
}

/// Transactions are objects too.
pub type TransactionId = ObjectId;

/// Ids of users.
pub type UserId = ObjectId;

/// Ids of accounts.
pub type AccountId = ObjectId;

/// The trunk, i.e. no transaction.
pub const NULL_TRANSACTION_ID: TransactionId = ObjectId::NULL;

impl ObjectId {
    /// The null id.
    pub const NULL: Self = Self { parts: [0; 4] };

    /// Create from raw parts
    #[must_use]
    pub const fn from_parts(parts: [u32; 4]) -> Self {
        Self { parts }
    }

    /// Get the raw parts
    #[must_use]
    pub const fn parts(&self) -> [u32; 4] {
        self.parts
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        self.parts[0] == 0 && self.parts[1] == 0 && self.parts[2] == 0 && self.parts[3] == 0
    }

    /// Build an id from its components.
    #[must_use]
    pub const fn make(type_value: u16, cell_id: CellId, counter: u64, hash: u32) -> Self {
        Self {
            parts: [
                hash,
                ((cell_id as u32) << 16) | type_value as u32,
                (counter & 0xffff_ffff) as u32,
                (counter >> 32) as u32,
            ],
        }
    }

    /// Deterministic id of a well-known (singleton) object of a cell.
    #[must_use]
    pub const fn well_known(object_type: ObjectType, cell_id: CellId, counter: u64) -> Self {
        Self::make(
            object_type.value(),
            cell_id,
            counter,
            well_known_hash(cell_id),
        )
    }

    /// Deterministic id of the schema object for `object_type`.
    #[must_use]
    pub const fn schema(object_type: ObjectType, cell_id: CellId) -> Self {
        Self::make(
            object_type.value() | SCHEMA_TYPE_MASK,
            cell_id,
            u64::MAX,
            well_known_hash(cell_id),
        )
    }

    /// Raw 16-bit type tag, including the schema bit.
    #[must_use]
    pub const fn type_value(&self) -> u16 {
        (self.parts[1] & 0xffff) as u16
    }

    /// Concrete type of this id; schema ids report the type they describe.
    #[must_use]
    pub const fn object_type(&self) -> Option<ObjectType> {
        ObjectType::from_value(self.type_value() & !SCHEMA_TYPE_MASK)
    }

    #[must_use]
    pub const fn is_schema(&self) -> bool {
        self.type_value() & SCHEMA_TYPE_MASK != 0
    }

    #[must_use]
    pub const fn cell_id(&self) -> CellId {
        (self.parts[1] >> 16) as CellId
    }

    /// Path literal addressing this object directly (`#<id>`).
    #[must_use]
    pub fn to_path(&self) -> String {
        format!("{OBJECT_ID_PATH_PREFIX}{self}")
    }

    /// Parse a `#<id>` path literal.
    pub fn from_path(path: &str) -> Result<Self, ObjectIdParseError> {
        path.strip_prefix(OBJECT_ID_PATH_PREFIX)
            .ok_or(ObjectIdParseError::MissingPrefix)?
            .parse()
    }
}

const fn well_known_hash(cell_id: CellId) -> u32 {
    (cell_id as u32).wrapping_mul(901_517) ^ 0x140a_8383
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x}-{:x}-{:x}",
            self.parts[0], self.parts[1], self.parts[2], self.parts[3]
        )
    }
}

impl FromStr for ObjectId {
    type Err = ObjectIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u32; 4];
        let mut groups = s.split('-');
        for part in &mut parts {
            let group = groups.next().ok_or(ObjectIdParseError::WrongGroupCount)?;
            *part = u32::from_str_radix(group, 16)
                .map_err(|_| ObjectIdParseError::InvalidGroup(group.to_string()))?;
        }
        if groups.next().is_some() {
            return Err(ObjectIdParseError::WrongGroupCount);
        }
        Ok(Self { parts })
    }
}

/// Errors that can occur when parsing an object id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectIdParseError {
    #[error("object id must consist of four hex groups")]
    WrongGroupCount,
    #[error("invalid hex group in object id: {0}")]
    InvalidGroup(String),
    #[error("object path must start with '{OBJECT_ID_PATH_PREFIX}'")]
    MissingPrefix,
}

/// Kinds of master objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[repr(u16)]
pub enum ObjectType {
    #[display("null")]
    Null = 0,
    #[display("transaction")]
    Transaction = 1,
    #[display("master")]
    Master = 2,
    #[display("account")]
    Account = 100,
    #[display("user")]
    User = 101,
    #[display("group")]
    Group = 102,
    #[display("document")]
    Document = 200,
    #[display("tag")]
    Tag = 201,
}

impl ObjectType {
    /// Every concrete type, in registration order.
    pub const ALL: [Self; 7] = [
        Self::Transaction,
        Self::Master,
        Self::Account,
        Self::User,
        Self::Group,
        Self::Document,
        Self::Tag,
    ];

    #[must_use]
    pub const fn value(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn from_value(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Transaction),
            2 => Some(Self::Master),
            100 => Some(Self::Account),
            101 => Some(Self::User),
            102 => Some(Self::Group),
            200 => Some(Self::Document),
            201 => Some(Self::Tag),
            _ => None,
        }
    }
}

/// An object id together with the transaction it is branched in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{object_id}:{transaction_id}")]
pub struct VersionedObjectId {
    pub object_id: ObjectId,
    pub transaction_id: TransactionId,
}

impl VersionedObjectId {
    /// The trunk version of an object.
    #[must_use]
    pub const fn trunk(object_id: ObjectId) -> Self {
        Self {
            object_id,
            transaction_id: NULL_TRANSACTION_ID,
        }
    }

    #[must_use]
    pub const fn branched(object_id: ObjectId, transaction_id: TransactionId) -> Self {
        Self {
            object_id,
            transaction_id,
        }
    }

    #[must_use]
    pub const fn is_branched(&self) -> bool {
        !self.transaction_id.is_null()
    }
}

/// Identifier of a leader's term of office.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[display("{_0}")]
pub struct Epoch(Uuid);

impl Epoch {
    /// No epoch (a stopped peer).
    pub const NIL: Self = Self(Uuid::nil());

    /// Generate a fresh epoch for a new leader term
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Self::NIL
    }
}
