//! The entity model contract
//!
//! Any record managed by crudkit implements [`Entity`]. Optional capabilities
//! (an external uuid, timestamps, soft delete) are declared structurally on the
//! entity's [`TableSchema`] rather than through inheritance. The repository
//! reads the schema to decide which columns it owns.

use super::field::FieldRegistry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Base trait for all entities in the system.
///
/// Implement it with [`impl_model!`](crate::impl_model) rather than by hand:
/// the macro keeps the table schema, the field registry and the struct in
/// agreement.
pub trait Entity: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used in messages, e.g. "Widget"
    fn entity_name() -> &'static str;

    /// Storage table and structural capabilities
    fn schema() -> &'static TableSchema;

    /// Filterable and sortable fields
    fn fields() -> &'static FieldRegistry<Self>;

    /// Primary key assigned by the store
    fn id(&self) -> i64;

    /// External identifier, when the table declares one
    fn uuid(&self) -> Option<Uuid> {
        None
    }

    /// Soft-delete marker, when the table declares one
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    /// Check if the entity has been soft-deleted
    fn is_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

/// Table name plus the structural capabilities of an entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub uuid: bool,
    pub timestamps: bool,
    pub soft_delete: bool,
    pub unique: &'static [&'static str],
}

impl TableSchema {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            uuid: false,
            timestamps: false,
            soft_delete: false,
            unique: &[],
        }
    }

    pub const fn uuid(mut self) -> Self {
        self.uuid = true;
        self
    }

    pub const fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub const fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    pub const fn unique(mut self, columns: &'static [&'static str]) -> Self {
        self.unique = columns;
        self
    }

    /// Every column carrying a uniqueness constraint
    pub fn unique_columns(&self) -> Vec<&'static str> {
        let mut columns = Vec::with_capacity(self.unique.len() + 1);
        if self.uuid {
            columns.push("uuid");
        }
        columns.extend(self.unique.iter().copied().filter(|c| *c != "uuid"));
        columns
    }

    /// Columns only the repository may write
    pub fn managed_columns(&self) -> Vec<&'static str> {
        let mut columns = vec!["id"];
        if self.uuid {
            columns.push("uuid");
        }
        if self.timestamps {
            columns.extend(["created_at", "updated_at"]);
        }
        if self.soft_delete {
            columns.push("deleted_at");
        }
        columns
    }
}

/// Visibility of soft-deleted rows in a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedState {
    /// Exclude soft-deleted rows
    #[default]
    Active,
    /// Only soft-deleted rows
    DeletedOnly,
    /// Ignore the soft-delete marker
    All,
}

impl DeletedState {
    /// Whether a row with the given marker is visible under this state
    pub fn admits(&self, deleted_at: Option<DateTime<Utc>>) -> bool {
        match self {
            DeletedState::Active => deleted_at.is_none(),
            DeletedState::DeletedOnly => deleted_at.is_some(),
            DeletedState::All => true,
        }
    }
}

impl FromStr for DeletedState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "active" => Ok(DeletedState::Active),
            "deleted_only" => Ok(DeletedState::DeletedOnly),
            "all" => Ok(DeletedState::All),
            other => Err(format!(
                "Must be one of: active, deleted_only, all (got '{}').",
                other
            )),
        }
    }
}

/// Which identifier a route or lookup addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdField {
    Id,
    #[default]
    Uuid,
}

impl IdField {
    /// Parse a path segment into a reference. Malformed ids resolve to `None`.
    pub fn parse(&self, raw: &str) -> Option<EntityRef> {
        match self {
            IdField::Id => raw.parse().ok().map(EntityRef::Id),
            IdField::Uuid => Uuid::parse_str(raw).ok().map(EntityRef::Uuid),
        }
    }
}

/// A resolved identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Id(i64),
    Uuid(Uuid),
}

impl EntityRef {
    pub fn id_field(&self) -> IdField {
        match self {
            EntityRef::Id(_) => IdField::Id,
            EntityRef::Uuid(_) => IdField::Uuid,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Id(id) => write!(f, "{}", id),
            EntityRef::Uuid(uuid) => write!(f, "{}", uuid),
        }
    }
}

impl From<i64> for EntityRef {
    fn from(id: i64) -> Self {
        EntityRef::Id(id)
    }
}

impl From<Uuid> for EntityRef {
    fn from(uuid: Uuid) -> Self {
        EntityRef::Uuid(uuid)
    }
}
