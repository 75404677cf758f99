//! Predicate translator (C4): a small, explicit predicate algebra compiled
//! to parameterised SQL `WHERE` fragments.
//!
//! Rust has no runtime facility for inspecting a typed closure as an
//! expression tree, so call sites build a [`Predicate`] value explicitly
//! instead of writing a lambda — the substitution named in the
//! specification's design notes. Column resolution always goes through the
//! entity's [`EntityDescriptor`]; no field name is trusted without being
//! checked against it first, so no user-provided string ever reaches the
//! SQL text unparameterised.

use rusqlite::types::Value as SqlValue;

use crate::error::{Error, Result};
use crate::metadata::EntityDescriptor;

/// A comparison operator over a single column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn as_sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A typed boolean expression over an entity's mapped columns.
///
/// Field names are plain `&'static str`s resolved against the entity's
/// descriptor at translation time, not at construction time — this keeps
/// the tree cheap to build and lets [`translate`] report exactly which
/// field was unsupported.
#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        field: &'static str,
        op: CompareOp,
        value: SqlValue,
    },
    Contains {
        field: &'static str,
        text: String,
    },
    StartsWith {
        field: &'static str,
        text: String,
    },
    EndsWith {
        field: &'static str,
        text: String,
    },
    In {
        field: &'static str,
        values: Vec<SqlValue>,
    },
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Compare { field, op: CompareOp::Eq, value: value.into() }
    }
    pub fn ne(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Compare { field, op: CompareOp::Ne, value: value.into() }
    }
    pub fn lt(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Compare { field, op: CompareOp::Lt, value: value.into() }
    }
    pub fn le(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Compare { field, op: CompareOp::Le, value: value.into() }
    }
    pub fn gt(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Compare { field, op: CompareOp::Gt, value: value.into() }
    }
    pub fn ge(field: &'static str, value: impl Into<SqlValue>) -> Self {
        Predicate::Compare { field, op: CompareOp::Ge, value: value.into() }
    }
    pub fn contains(field: &'static str, text: impl Into<String>) -> Self {
        Predicate::Contains { field, text: text.into() }
    }
    pub fn starts_with(field: &'static str, text: impl Into<String>) -> Self {
        Predicate::StartsWith { field, text: text.into() }
    }
    pub fn ends_with(field: &'static str, text: impl Into<String>) -> Self {
        Predicate::EndsWith { field, text: text.into() }
    }
    pub fn in_list(field: &'static str, values: Vec<SqlValue>) -> Self {
        Predicate::In { field, values }
    }
    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }
}

/// Sort direction for [`OrderBy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// An ordering key selector, translated to `ORDER BY col ASC|DESC`.
#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: &'static str,
    pub direction: Direction,
}

impl OrderBy {
    pub fn asc(field: &'static str) -> Self {
        OrderBy { field, direction: Direction::Asc }
    }
    pub fn desc(field: &'static str) -> Self {
        OrderBy { field, direction: Direction::Desc }
    }

    /// Translates to a single `col ASC|DESC` fragment, resolving `field`
    /// against `descriptor` the same way [`translate`] resolves predicate fields.
    pub fn to_sql_fragment(&self, descriptor: &EntityDescriptor) -> Result<String> {
        let column = resolve_column(descriptor, self.field)?;
        let dir = match self.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        Ok(format!("{column} {dir}"))
    }
}

/// The result of translating a [`Predicate`]: a SQL fragment plus its
/// named, positionally-generated parameters (`:p0`, `:p1`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Translated {
    pub sql: String,
    pub params: Vec<(String, SqlValue)>,
}

fn resolve_column<'a>(descriptor: &'a EntityDescriptor, field: &str) -> Result<&'a str> {
    descriptor
        .column_index()
        .get(field)
        .map(|c| c.name)
        .ok_or_else(|| Error::UnsupportedPredicate(format!("no mapped column for field '{field}'")))
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Translates a [`Predicate`] into a parameterised `WHERE`-clause fragment
/// (without the `WHERE` keyword) against `descriptor`.
///
/// Deterministic and side-effect-free: translating the same predicate twice
/// produces byte-identical SQL and parameter lists (I8 in the
/// specification's testable properties).
pub fn translate(pred: &Predicate, descriptor: &EntityDescriptor) -> Result<Translated> {
    let mut params = Vec::new();
    let mut counter = 0usize;
    let sql = translate_inner(pred, descriptor, &mut params, &mut counter)?;
    Ok(Translated { sql, params })
}

fn next_param_name(counter: &mut usize) -> String {
    let name = format!("p{counter}");
    *counter += 1;
    name
}

fn translate_inner(
    pred: &Predicate,
    descriptor: &EntityDescriptor,
    params: &mut Vec<(String, SqlValue)>,
    counter: &mut usize,
) -> Result<String> {
    match pred {
        Predicate::Compare { field, op, value } => {
            let column = resolve_column(descriptor, field)?;
            let name = next_param_name(counter);
            params.push((name.clone(), value.clone()));
            Ok(format!("{column} {} :{name}", op.as_sql()))
        }
        Predicate::Contains { field, text } => like_fragment(descriptor, field, format!("%{}%", escape_like(text)), params, counter),
        Predicate::StartsWith { field, text } => like_fragment(descriptor, field, format!("{}%", escape_like(text)), params, counter),
        Predicate::EndsWith { field, text } => like_fragment(descriptor, field, format!("%{}", escape_like(text)), params, counter),
        Predicate::In { field, values } => {
            let column = resolve_column(descriptor, field)?;
            if values.is_empty() {
                // An empty IN-list matches nothing; `1 = 0` needs no parameter.
                return Ok("1 = 0".to_string());
            }
            let mut names = Vec::with_capacity(values.len());
            for v in values {
                let name = next_param_name(counter);
                params.push((name.clone(), v.clone()));
                names.push(format!(":{name}"));
            }
            Ok(format!("{column} IN ({})", names.join(", ")))
        }
        Predicate::And(a, b) => {
            let l = translate_inner(a, descriptor, params, counter)?;
            let r = translate_inner(b, descriptor, params, counter)?;
            Ok(format!("({l}) AND ({r})"))
        }
        Predicate::Or(a, b) => {
            let l = translate_inner(a, descriptor, params, counter)?;
            let r = translate_inner(b, descriptor, params, counter)?;
            Ok(format!("({l}) OR ({r})"))
        }
        Predicate::Not(a) => {
            let inner = translate_inner(a, descriptor, params, counter)?;
            Ok(format!("NOT ({inner})"))
        }
    }
}

fn like_fragment(
    descriptor: &EntityDescriptor,
    field: &str,
    pattern: String,
    params: &mut Vec<(String, SqlValue)>,
    counter: &mut usize,
) -> Result<String> {
    let column = resolve_column(descriptor, field)?;
    let name = next_param_name(counter);
    params.push((name.clone(), SqlValue::Text(pattern)));
    Ok(format!("{column} LIKE :{name} ESCAPE '\\'"))
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
                ColumnDescriptor { name: "id", sql_type: SqlType::Text, nullable: false, default: None, unique: false, order: 0, audit_role: None, check: None, computed: None, encrypted: None, json_converter: false },
                ColumnDescriptor { name: "name", sql_type: SqlType::Text, nullable: false, default: None, unique: false, order: 1, audit_role: None, check: None, computed: None, encrypted: None, json_converter: false },
                ColumnDescriptor { name: "price", sql_type: SqlType::Integer, nullable: false, default: None, unique: false, order: 2, audit_role: None, check: None, computed: None, encrypted: None, json_converter: false },
                ColumnDescriptor { name: "version", sql_type: SqlType::Integer, nullable: false, default: None, unique: false, order: 3, audit_role: Some(AuditRole::Version), check: None, computed: None, encrypted: None, json_converter: false },
                ColumnDescriptor { name: "is_deleted", sql_type: SqlType::Integer, nullable: false, default: Some("0"), unique: false, order: 4, audit_role: Some(AuditRole::IsDeleted), check: None, computed: None, encrypted: None, json_converter: false },
            ],
            primary_key: PrimaryKeyDescriptor { columns: vec!["id", "version"], auto_increment: false },
            indexes: vec![],
            foreign_keys: vec![],
        }
    }

    #[test]
    fn compare_generates_single_parameter() {
        let d = descriptor();
        let pred = Predicate::ge("price", 100i64);
        let t = translate(&pred, &d).unwrap();
        assert_eq!(t.sql, "price >= :p0");
        assert_eq!(t.params, vec![("p0".into(), SqlValue::Integer(100))]);
    }

    #[test]
    fn and_or_not_compose_and_number_params_left_to_right() {
        let d = descriptor();
        let pred = Predicate::ge("price", 100i64)
            .and(Predicate::eq("is_deleted", 0i64))
            .or(Predicate::eq("name", SqlValue::Text("bolt".to_string())).not());
        let t = translate(&pred, &d).unwrap();
        assert_eq!(t.sql, "(price >= :p0) AND (is_deleted = :p1) OR NOT (name = :p2)");
        assert_eq!(t.params.len(), 3);
    }

    #[test]
    fn contains_escapes_wildcards_and_uses_like() {
        let d = descriptor();
        let pred = Predicate::contains("name", "50%_off");
        let t = translate(&pred, &d).unwrap();
        assert_eq!(t.sql, "name LIKE :p0 ESCAPE '\\'");
        assert_eq!(t.params[0].1, SqlValue::Text("%50\\%\\_off%".to_string()));
    }

    #[test]
    fn in_list_expands_to_n_parameters() {
        let d = descriptor();
        let pred = Predicate::in_list("id", vec![SqlValue::Text("a".into()), SqlValue::Text("b".into())]);
        let t = translate(&pred, &d).unwrap();
        assert_eq!(t.sql, "id IN (:p0, :p1)");
        assert_eq!(t.params.len(), 2);
    }

    #[test]
    fn empty_in_list_matches_nothing_without_params() {
        let d = descriptor();
        let pred = Predicate::in_list("id", vec![]);
        let t = translate(&pred, &d).unwrap();
        assert_eq!(t.sql, "1 = 0");
        assert!(t.params.is_empty());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let d = descriptor();
        let pred: Predicate = Predicate::eq("nonexistent", 1i64);
        assert!(matches!(translate(&pred, &d), Err(Error::UnsupportedPredicate(_))));
    }

    #[test]
    fn translation_is_idempotent() {
        let d = descriptor();
        let pred = Predicate::ge("price", 10i64).and(Predicate::contains("name", "bolt"));
        let t1 = translate(&pred, &d).unwrap();
        let t2 = translate(&pred, &d).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn order_by_resolves_column_name() {
        let d = descriptor();
        let ob = OrderBy::desc("price");
        assert_eq!(ob.to_sql_fragment(&d).unwrap(), "price DESC");
    }
}
