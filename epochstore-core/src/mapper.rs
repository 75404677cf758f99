//! Binds entity values to statement parameters and reads them back (C3).
//!
//! SQL text is built once per [`crate::metadata::Entity`] type from its
//! [`crate::metadata::EntityDescriptor`] (the column list never changes at
//! runtime), then reused across every call. Every value is bound by name
//! (`:column`); nothing here ever interpolates a caller-supplied value into
//! SQL text.

use crate::metadata::{Entity, EntityDescriptor, Mapper};

/// The "head" pointer table: one row per `(type_name, key)` giving the
/// current version and deletion flag.
///
/// A plain append-only history table has no way to atomically express
/// "insert this row only if the current version is still V" — `INSERT` has
/// no `WHERE` clause. This shadow table gives optimistic concurrency (and
/// `Get`/`Create`) an O(1), race-free target: a conditional `UPDATE` against
/// `entity_head` is the same atomic compare-and-swap the specification's
/// `Update` contract describes, just performed against the pointer rather
/// than the (immutable) history row itself.
pub const ENTITY_HEAD_DDL: &str = "
    CREATE TABLE IF NOT EXISTS entity_head (
        type_name       TEXT    NOT NULL,
        entity_key      TEXT    NOT NULL,
        current_version INTEGER NOT NULL,
        head_is_deleted INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (type_name, entity_key)
    );
";

/// DDL for the list-membership map backing batch create/update/delete
/// operations keyed by a list identifier `L` (§4.5.1): a many-to-many map
/// of `(list_key, entry_key)` pinned to the version each entry had when it
/// was added to the list.
pub const LIST_MEMBERSHIP_DDL: &str = "
    CREATE TABLE IF NOT EXISTS list_membership (
        type_name  TEXT    NOT NULL,
        list_key    TEXT    NOT NULL,
        entry_key   TEXT    NOT NULL,
        version     INTEGER NOT NULL,
        PRIMARY KEY (type_name, list_key, entry_key)
    );
";

/// Builds `SELECT * FROM <table> WHERE <key_col> = :key AND <version_col> = :version`.
pub fn select_at_version_sql(d: &EntityDescriptor) -> String {
    format!(
        "SELECT * FROM {} WHERE {} = :key AND {} = :version",
        d.qualified_table(),
        d.key_column(),
        d.version_column()
    )
}

/// Builds the INSERT statement for a new history row, columns in declared order.
pub fn insert_sql(d: &EntityDescriptor) -> String {
    let mut cols: Vec<_> = d.columns.iter().collect();
    cols.sort_by_key(|c| c.order);
    let names: Vec<&str> = cols.iter().map(|c| c.name).collect();
    let placeholders: Vec<String> = names.iter().map(|n| format!(":{n}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        d.qualified_table(),
        names.join(", "),
        placeholders.join(", ")
    )
}

/// Builds the `UPDATE ... SET is_deleted = 1, last_write_time = :now` soft-delete
/// statement against the entity table (the head table gates concurrency separately).
pub fn soft_delete_sql(d: &EntityDescriptor) -> String {
    let last_write = d
        .audit_column(crate::metadata::AuditRole::LastWriteTime)
        .map(|c| c.name)
        .unwrap_or("last_write_time");
    let is_deleted = d
        .audit_column(crate::metadata::AuditRole::IsDeleted)
        .map(|c| c.name)
        .unwrap_or("is_deleted");
    format!(
        "UPDATE {} SET {is_deleted} = 1, {last_write} = :now WHERE {} = :key AND {} = :version",
        d.qualified_table(),
        d.key_column(),
        d.version_column(),
    )
}

/// Builds the unconditional hard-delete statement.
pub fn hard_delete_sql(d: &EntityDescriptor) -> String {
    format!(
        "DELETE FROM {} WHERE {} = :key",
        d.qualified_table(),
        d.key_column()
    )
}

/// Binds an entity's named parameters plus `:key`/`:version` convenience
/// aliases, executing `stmt` with them.
///
/// `Mapper::bind_named` returns borrowed references into `entity`, so the
/// combined parameter list here must not outlive `entity`.
pub fn bind_and_execute<E: Mapper>(
    stmt: &mut rusqlite::Statement<'_>,
    entity: &E,
) -> rusqlite::Result<usize> {
    let named = entity.bind_named();
    let params: Vec<(&str, &dyn rusqlite::types::ToSql)> =
        named.iter().map(|(n, v)| (*n, *v)).collect();
    stmt.execute(params.as_slice())
}

/// Serialises a key the way [`crate::metadata::EntityKey`] does, provided
/// for call sites that only have the trait object's static methods handy.
pub fn serialise_key<K: crate::metadata::EntityKey>(key: &K) -> String {
    key.serialise()
}

/// Deserialises a key previously produced by [`serialise_key`].
pub fn deserialise_key<K: crate::metadata::EntityKey>(text: &str) -> crate::error::Result<K> {
    K::deserialise(text)
}

/// Serialises a whole entity to bytes via the chosen [`crate::serializer::ValueSerializer`],
/// used for payload-size estimation in audit rows and opaque bulk-export blobs.
pub fn serialise_entity<E, S>(entity: &E) -> crate::error::Result<Vec<u8>>
where
    E: Entity + serde::Serialize,
    S: crate::serializer::ValueSerializer<E>,
{
    S::serialize(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::*;

    fn descriptor() -> EntityDescriptor {
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
                ColumnDescriptor {
                    name: "last_write_time",
                    sql_type: SqlType::Integer,
                    nullable: false,
                    default: None,
                    unique: false,
                    order: 3,
                    audit_role: Some(AuditRole::LastWriteTime),
                    check: None,
                    computed: None,
                    encrypted: None,
                    json_converter: false,
                },
            ],
            primary_key: PrimaryKeyDescriptor { columns: vec!["id", "version"], auto_increment: false },
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    #[test]
    fn insert_sql_lists_columns_in_order() {
        let sql = insert_sql(&descriptor());
        assert_eq!(
            sql,
            "INSERT INTO widgets (id, version, is_deleted, last_write_time) VALUES (:id, :version, :is_deleted, :last_write_time)"
        );
    }

    #[test]
    fn soft_delete_targets_key_and_version() {
        let sql = soft_delete_sql(&descriptor());
        assert!(sql.contains("WHERE id = :key AND version = :version"));
        assert!(sql.starts_with("UPDATE widgets SET is_deleted = 1, last_write_time = :now"));
    }

    #[test]
    fn hard_delete_is_unconditional_on_key() {
        let sql = hard_delete_sql(&descriptor());
        assert_eq!(sql, "DELETE FROM widgets WHERE id = :key");
    }
}
