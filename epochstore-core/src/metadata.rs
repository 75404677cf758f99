//! Entity metadata registry (C2): the runtime descriptor types that
//! `#[derive(Entity)]` (in `epochstore-derive`) produces, plus the traits a
//! mapped type must implement to be usable with [`crate::provider::PersistenceProvider`].
//!
//! A type's [`EntityDescriptor`] is built once, as a `const`/`static`, and
//! consulted by DDL generation (C2), the mapper (C3), and the predicate
//! translator (C4) to resolve logical property names to column names rather
//! than hard-coding them.

use std::collections::HashMap;

/// Engine-level storage class a column is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
    Blob,
}

impl SqlType {
    pub fn as_ddl(self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
            SqlType::Blob => "BLOB",
        }
    }
}

/// Which tracking role a column plays, so the provider can locate audit
/// columns by role instead of by a hard-coded name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditRole {
    CreatedTime,
    LastWriteTime,
    Version,
    IsDeleted,
    CreatedBy,
    LastWriteBy,
    ExpirationTime,
}

/// Encryption annotation, parsed and recorded but not applied: encryption at
/// rest is an explicit Non-goal. Retained in the descriptor so a future
/// revision (or an external key-management collaborator) can see which
/// columns were declared sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedSpec {
    pub method: Option<&'static str>,
    pub key_name: Option<&'static str>,
}

/// A `CHECK (...)` constraint on a column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSpec {
    pub name: Option<&'static str>,
    pub expr: &'static str,
}

/// A computed-column expression (`GENERATED ALWAYS AS (...)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedSpec {
    pub expr: &'static str,
    pub persisted: bool,
}

/// One column in a mapped table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: &'static str,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub default: Option<&'static str>,
    pub unique: bool,
    pub order: u32,
    pub audit_role: Option<AuditRole>,
    pub check: Option<CheckSpec>,
    pub computed: Option<ComputedSpec>,
    pub encrypted: Option<EncryptedSpec>,
    /// Value is serialised to JSON text before binding (the `json_converter`
    /// annotation), rather than mapped column-for-column.
    pub json_converter: bool,
}

/// Primary key participation, single or ordered composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyDescriptor {
    /// Column names in declared order. A single-element vec is an inline
    /// `PRIMARY KEY`; more than one emits a table-level constraint clause.
    pub columns: Vec<&'static str>,
    pub auto_increment: bool,
}

/// One column within a named index group, with its position in that index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: &'static str,
    pub order: u32,
}

/// A named index, built by grouping columns that share an `index(name = ...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<IndexColumn>,
    pub unique: bool,
    pub filter: Option<&'static str>,
}

/// One column within a named, possibly-composite foreign key, with its
/// ordinal position in that key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyColumn {
    pub column: &'static str,
    pub ref_column: &'static str,
    pub ordinal: u32,
}

/// A named foreign-key constraint, built by grouping columns that share a
/// `foreign_key(name = ...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDescriptor {
    pub name: String,
    pub ref_table: &'static str,
    pub columns: Vec<ForeignKeyColumn>,
    pub on_delete: Option<&'static str>,
    pub on_update: Option<&'static str>,
}

/// Full table mapping for one entity type, produced by `#[derive(Entity)]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDescriptor {
    pub table: &'static str,
    pub schema: Option<&'static str>,
    pub columns: Vec<ColumnDescriptor>,
    pub primary_key: PrimaryKeyDescriptor,
    pub indexes: Vec<IndexDescriptor>,
    pub foreign_keys: Vec<ForeignKeyDescriptor>,
}

impl EntityDescriptor {
    /// Builds a property-name → column-descriptor lookup.
    ///
    /// Used by the predicate translator (C4) to resolve a typed field
    /// reference to its column without hard-coding names at call sites.
    pub fn column_index(&self) -> HashMap<&'static str, &ColumnDescriptor> {
        self.columns.iter().map(|c| (c.name, c)).collect()
    }

    /// The column holding a given audit role, if the entity declares one.
    pub fn audit_column(&self, role: AuditRole) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.audit_role == Some(role))
    }

    /// The qualified table name (`schema.table`, or just `table`).
    pub fn qualified_table(&self) -> String {
        match self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.to_string(),
        }
    }

    /// True if every column has an unambiguous storage class, in which case
    /// `STRICT` tables are used (matching the reference crate's schema style).
    pub fn supports_strict(&self) -> bool {
        // All four SqlType variants map 1:1 onto a SQLite STRICT type name,
        // so this is always true today; kept as a hook for a future loosely
        // typed column kind (e.g. `ANY`) that would need to opt out.
        true
    }

    /// The primary-key column that holds the user-chosen entity key, i.e.
    /// the one primary-key column that is *not* the version column.
    ///
    /// # Panics
    /// Panics if the descriptor has no non-version primary-key column; this
    /// indicates a malformed descriptor and is checked eagerly by
    /// [`EntityDescriptor::validate_for_versioned_storage`].
    pub fn key_column(&self) -> &'static str {
        let version_col = self.audit_column(AuditRole::Version).map(|c| c.name);
        self.primary_key
            .columns
            .iter()
            .copied()
            .find(|c| Some(*c) != version_col)
            .expect("versioned entity primary key must include a non-version column")
    }

    /// The column holding the version tracking field.
    ///
    /// # Panics
    /// Panics if the entity declares no `#[audit_field(version)]` column.
    pub fn version_column(&self) -> &'static str {
        self.audit_column(AuditRole::Version)
            .expect("versioned entity must declare an audit_field(version) column")
            .name
    }

    /// The column holding the optional TTL tracking field, if this entity
    /// declares one via `#[audit_field(expiration_time)]`.
    pub fn expiration_time_column(&self) -> Option<&'static str> {
        self.audit_column(AuditRole::ExpirationTime).map(|c| c.name)
    }

    /// Returns an error if this descriptor violates a structural invariant
    /// the versioned provider depends on (see §4.2 of the specification).
    pub fn validate_for_versioned_storage(&self) -> crate::error::Result<()> {
        if self.audit_column(AuditRole::Version).is_none() {
            return Err(crate::error::Error::ValidationFailed(format!(
                "entity {} has no #[audit_field(version)] column; cannot register with PersistenceProvider",
                self.table
            )));
        }
        if self.audit_column(AuditRole::IsDeleted).is_none() {
            return Err(crate::error::Error::ValidationFailed(format!(
                "entity {} has no #[audit_field(is_deleted)] column; cannot register with PersistenceProvider",
                self.table
            )));
        }
        if self.primary_key.columns.is_empty() {
            return Err(crate::error::Error::ValidationFailed(format!(
                "entity {} declares no primary key",
                self.table
            )));
        }
        Ok(())
    }
}

/// A key type usable as an entity's primary identity.
///
/// Opaque, user-chosen, equatable, and serialisable to text — the contract
/// named in §3 of the specification.
pub trait EntityKey: Clone + Eq + std::hash::Hash + Send + Sync + 'static {
    fn serialise(&self) -> String;
    fn deserialise(s: &str) -> crate::error::Result<Self>
    where
        Self: Sized;
}

impl EntityKey for String {
    fn serialise(&self) -> String {
        self.clone()
    }
    fn deserialise(s: &str) -> crate::error::Result<Self> {
        Ok(s.to_string())
    }
}

impl EntityKey for i64 {
    fn serialise(&self) -> String {
        self.to_string()
    }
    fn deserialise(s: &str) -> crate::error::Result<Self> {
        s.parse().map_err(|_| {
            crate::error::Error::ValidationFailed(format!("key '{s}' is not a valid i64"))
        })
    }
}

impl EntityKey for uuid::Uuid {
    fn serialise(&self) -> String {
        self.to_string()
    }
    fn deserialise(s: &str) -> crate::error::Result<Self> {
        uuid::Uuid::parse_str(s)
            .map_err(|e| crate::error::Error::ValidationFailed(format!("key '{s}' is not a valid uuid: {e}")))
    }
}

/// A mapped entity type: the contract every `#[derive(Entity)]` struct
/// implements, giving [`crate::provider::PersistenceProvider`] uniform
/// access to the tracking fields named in §3 regardless of the entity's
/// domain-specific columns.
pub trait Entity: Sized + Send + Sync + Clone + 'static {
    /// The entity's primary key type.
    type Key: EntityKey;

    /// The compile-time-generated table/column mapping for this type.
    fn descriptor() -> &'static EntityDescriptor;

    fn key(&self) -> Self::Key;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn is_deleted(&self) -> bool;
    fn set_deleted(&mut self, deleted: bool);
    fn created_time(&self) -> i64;
    fn set_created_time(&mut self, t: i64);
    fn last_write_time(&self) -> i64;
    fn set_last_write_time(&mut self, t: i64);
    /// Unix-seconds expiry, if this entity type supports TTL-based cleanup.
    fn expiration_time(&self) -> Option<i64> {
        None
    }
}

/// Binds insert/update parameters and reads rows back into an entity —
/// the compile-time-generated half of C3 (the rest lives in
/// [`crate::mapper`]).
pub trait Mapper: Entity {
    /// Named bind values for every mapped column, in no particular order.
    /// Implementations return borrowed references so no allocation is
    /// needed purely to bind parameters.
    fn bind_named(&self) -> Vec<(&'static str, &dyn rusqlite::types::ToSql)>;

    /// Reads one row, including tracking columns, into an owned entity.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> EntityDescriptor {
        EntityDescriptor {
            table: "widgets",
            schema: None,
            columns: vec![
                ColumnDescriptor {
                    name: "id",
                    sql_type: SqlType::Text,
                    nullable: false,
                    default: None,
                    unique: false,
                    order: 0,
                    audit_role: None,
                    check: None,
                    computed: None,
                    encrypted: None,
                    json_converter: false,
                },
                ColumnDescriptor {
                    name: "version",
                    sql_type: SqlType::Integer,
                    nullable: false,
                    default: None,
                    unique: false,
                    order: 1,
                    audit_role: Some(AuditRole::Version),
                    check: None,
                    computed: None,
                    encrypted: None,
                    json_converter: false,
                },
                ColumnDescriptor {
                    name: "is_deleted",
                    sql_type: SqlType::Integer,
                    nullable: false,
                    default: Some("0"),
                    unique: false,
                    order: 2,
                    audit_role: Some(AuditRole::IsDeleted),
                    check: None,
                    computed: None,
                    encrypted: None,
                    json_converter: false,
                },
            ],
            primary_key: PrimaryKeyDescriptor {
                columns: vec!["id", "version"],
                auto_increment: false,
            },
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    #[test]
    fn validates_presence_of_version_and_is_deleted() {
        let d = sample_descriptor();
        assert!(d.validate_for_versioned_storage().is_ok());

        let mut missing_version = d.clone();
        missing_version.columns.retain(|c| c.audit_role != Some(AuditRole::Version));
        assert!(missing_version.validate_for_versioned_storage().is_err());
    }

    #[test]
    fn column_index_resolves_by_name() {
        let d = sample_descriptor();
        let idx = d.column_index();
        assert!(idx.contains_key("version"));
        assert!(!idx.contains_key("nonexistent"));
    }

    #[test]
    fn audit_column_lookup() {
        let d = sample_descriptor();
        assert_eq!(d.audit_column(AuditRole::Version).unwrap().name, "version");
        assert!(d.audit_column(AuditRole::CreatedBy).is_none());
    }
}
