//! Serializer registry (C8).
//!
//! Every mapped type picks a [`ValueSerializer`] by precedence: a custom
//! converter annotation, a structured-contract annotation (the entity's own
//! columnar mapping — nothing further to do), or the default JSON
//! serializer. The chosen `TYPE_TAG` is what gets persisted in the type
//! registry table (C2's "referential target" for shared tables), so a
//! future process can pick a compatible deserializer without guessing.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

/// Serialises and deserialises a value to/from an opaque byte blob.
///
/// Used for size estimation (payload-size audit fields), opaque-blob
/// storage columns, and bulk export/import of whole entities.
pub trait ValueSerializer<T> {
    /// A stable tag identifying this serializer, persisted in the type
    /// registry table so a reader can pick a compatible deserializer.
    const TYPE_TAG: &'static str;

    fn serialize(value: &T) -> Result<Vec<u8>>;
    fn deserialize(bytes: &[u8]) -> Result<T>;
}

/// The default serializer: structured JSON via `serde_json`.
pub struct JsonSerializer;

impl<T> ValueSerializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    const TYPE_TAG: &'static str = "json/v1";

    fn serialize(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization {
            type_tag: <Self as ValueSerializer<T>>::TYPE_TAG,
            message: e.to_string(),
        })
    }

    fn deserialize(bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Serialization {
            type_tag: <Self as ValueSerializer<T>>::TYPE_TAG,
            message: e.to_string(),
        })
    }
}

/// The default serializer's registry tag. `TYPE_TAG` does not vary with the
/// mapped type, so `()` (itself `Serialize`/`DeserializeOwned`) stands in as
/// a concrete witness type to resolve the associated const.
pub fn default_serializer_tag() -> &'static str {
    <JsonSerializer as ValueSerializer<()>>::TYPE_TAG
}

/// DDL for the type registry table: `(type_name, assembly_version)` → the
/// declared store type and serializer type.
///
/// `assembly_version` holds the `CARGO_PKG_VERSION` of the crate that
/// registered the type — there is no "assembly" concept in Rust, so the
/// crate version string is the direct, documented substitute.
pub const TYPE_REGISTRY_DDL: &str = "
    CREATE TABLE IF NOT EXISTS type_registry (
        type_name        TEXT NOT NULL,
        assembly_version  TEXT NOT NULL,
        store_type        TEXT NOT NULL,
        serializer_type   TEXT NOT NULL,
        PRIMARY KEY (type_name, assembly_version)
    );
";

/// Registers (or re-registers, idempotently) a type's store/serializer pair.
pub fn register_type(
    conn: &rusqlite::Connection,
    type_name: &str,
    assembly_version: &str,
    store_type: &str,
    serializer_type: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO type_registry (type_name, assembly_version, store_type, serializer_type)
         VALUES (:type_name, :assembly_version, :store_type, :serializer_type)
         ON CONFLICT (type_name, assembly_version) DO UPDATE SET
            store_type = excluded.store_type,
            serializer_type = excluded.serializer_type",
        rusqlite::named_params! {
            ":type_name": type_name,
            ":assembly_version": assembly_version,
            ":store_type": store_type,
            ":serializer_type": serializer_type,
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Widget {
        name: String,
        count: u32,
    }

    #[test]
    fn json_round_trips() {
        let w = Widget { name: "bolt".into(), count: 7 };
        let bytes = JsonSerializer::serialize(&w).unwrap();
        let back: Widget = JsonSerializer::deserialize(&bytes).unwrap();
        assert_eq!(w, back);
    }

    #[test]
    fn malformed_bytes_report_type_tag() {
        let err = <JsonSerializer as ValueSerializer<Widget>>::deserialize(b"not json").unwrap_err();
        match err {
            Error::Serialization { type_tag, .. } => assert_eq!(type_tag, "json/v1"),
            other => panic!("expected Serialization error, got {other:?}"),
        }
    }

    #[test]
    fn type_registry_upsert_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(TYPE_REGISTRY_DDL).unwrap();
        register_type(&conn, "Widget", "0.1.0", "widgets", "json/v1").unwrap();
        register_type(&conn, "Widget", "0.1.0", "widgets", "json/v2").unwrap();

        let serializer: String = conn
            .query_row(
                "SELECT serializer_type FROM type_registry WHERE type_name = 'Widget'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(serializer, "json/v2");
    }
}
