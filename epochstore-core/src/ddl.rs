//! DDL generation from an [`EntityDescriptor`] (C2).
//!
//! Emits `CREATE TABLE IF NOT EXISTS` with columns in declared order,
//! inlines the primary key when it is a single column and emits a
//! table-level constraint clause for composite keys, one `CREATE INDEX`
//! per named index group, and foreign-key clauses grouped by constraint
//! name and ordered by ordinal.

use crate::metadata::EntityDescriptor;

/// Renders the full DDL (table + indexes) for one entity, as a sequence of
/// statements to run with `execute_batch`.
pub fn render_schema(descriptor: &EntityDescriptor) -> String {
    let mut out = String::new();
    out.push_str(&render_table(descriptor));
    out.push('\n');
    for index in &descriptor.indexes {
        out.push_str(&render_index(descriptor, index));
        out.push('\n');
    }
    out
}

fn render_table(d: &EntityDescriptor) -> String {
    let mut columns: Vec<&_> = d.columns.iter().collect();
    columns.sort_by_key(|c| c.order);

    let mut lines = Vec::new();
    for col in &columns {
        let mut line = format!("    {} {}", col.name, col.sql_type.as_ddl());
        let is_single_pk = d.primary_key.columns.len() == 1 && d.primary_key.columns[0] == col.name;
        if is_single_pk {
            line.push_str(" PRIMARY KEY");
            if d.primary_key.auto_increment {
                line.push_str(" AUTOINCREMENT");
            }
        }
        if !col.nullable && !is_single_pk {
            line.push_str(" NOT NULL");
        }
        if col.unique && !is_single_pk {
            line.push_str(" UNIQUE");
        }
        if let Some(default) = col.default {
            line.push_str(&format!(" DEFAULT {default}"));
        }
        if let Some(check) = &col.check {
            match check.name {
                Some(name) => line.push_str(&format!(" CONSTRAINT {name} CHECK ({})", check.expr)),
                None => line.push_str(&format!(" CHECK ({})", check.expr)),
            }
        }
        if let Some(computed) = &col.computed {
            let persisted = if computed.persisted { " STORED" } else { " VIRTUAL" };
            line.push_str(&format!(" GENERATED ALWAYS AS ({}){persisted}", computed.expr));
        }
        lines.push(line);
    }

    if d.primary_key.columns.len() > 1 {
        lines.push(format!(
            "    PRIMARY KEY ({})",
            d.primary_key.columns.join(", ")
        ));
    }

    let mut fks: Vec<_> = d.foreign_keys.iter().collect();
    fks.sort_by_key(|fk| fk.name.clone());
    for fk in fks {
        let mut cols: Vec<_> = fk.columns.iter().collect();
        cols.sort_by_key(|c| c.ordinal);
        let local: Vec<&str> = cols.iter().map(|c| c.column).collect();
        let remote: Vec<&str> = cols.iter().map(|c| c.ref_column).collect();
        let mut clause = format!(
            "    CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            fk.name,
            local.join(", "),
            fk.ref_table,
            remote.join(", ")
        );
        if let Some(on_delete) = fk.on_delete {
            clause.push_str(&format!(" ON DELETE {on_delete}"));
        }
        if let Some(on_update) = fk.on_update {
            clause.push_str(&format!(" ON UPDATE {on_update}"));
        }
        lines.push(clause);
    }

    let strict = if d.supports_strict() { " STRICT" } else { "" };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n){strict};",
        d.qualified_table(),
        lines.join(",\n")
    )
}

fn render_index(d: &EntityDescriptor, index: &crate::metadata::IndexDescriptor) -> String {
    let mut cols: Vec<_> = index.columns.iter().collect();
    cols.sort_by_key(|c| c.order);
    let col_list: Vec<&str> = cols.iter().map(|c| c.name).collect();
    let unique = if index.unique { "UNIQUE " } else { "" };
    let mut stmt = format!(
        "CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({});",
        index.name,
        d.table,
        col_list.join(", ")
    );
    if let Some(filter) = index.filter {
        stmt = format!(
            "CREATE {unique}INDEX IF NOT EXISTS {} ON {} ({}) WHERE {filter};",
            index.name,
            d.table,
            col_list.join(", ")
        );
    }
    stmt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::*;

    fn widget_descriptor() -> EntityDescriptor {
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
                    name: "name",
                    sql_type: SqlType::Text,
                    nullable: false,
                    default: None,
                    unique: false,
                    order: 2,
                    audit_role: None,
                    check: Some(CheckSpec { name: None, expr: "length(name) > 0" }),
                    computed: None,
                    encrypted: None,
                    json_converter: false,
                },
            ],
            primary_key: PrimaryKeyDescriptor {
                columns: vec!["id", "version"],
                auto_increment: false,
            },
            indexes: vec![IndexDescriptor {
                name: "idx_widgets_name".to_string(),
                columns: vec![IndexColumn { name: "name", order: 0 }],
                unique: false,
                filter: None,
            }],
            foreign_keys: vec![],
        }
    }

    #[test]
    fn composite_primary_key_emits_table_constraint() {
        let sql = render_table(&widget_descriptor());
        assert!(sql.contains("PRIMARY KEY (id, version)"));
        assert!(!sql.contains("id TEXT PRIMARY KEY"));
    }

    #[test]
    fn check_constraint_is_inlined() {
        let sql = render_table(&widget_descriptor());
        assert!(sql.contains("CHECK (length(name) > 0)"));
    }

    #[test]
    fn index_is_emitted_separately() {
        let sql = render_schema(&widget_descriptor());
        assert!(sql.contains("CREATE INDEX IF NOT EXISTS idx_widgets_name ON widgets (name);"));
    }

    #[test]
    fn single_column_key_is_inlined_and_autoincrement_respected() {
        let mut d = widget_descriptor();
        d.primary_key = PrimaryKeyDescriptor { columns: vec!["id"], auto_increment: true };
        let sql = render_table(&d);
        assert!(sql.contains("id TEXT PRIMARY KEY AUTOINCREMENT"));
    }
}
