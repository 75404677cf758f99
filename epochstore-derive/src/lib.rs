//! `#[derive(Entity)]`: generates an `epochstore_core::EntityDescriptor`,
//! the `Entity` trait impl, and the `Mapper` trait impl for a struct.
//!
//! Attributes are parsed by hand with `syn::Attribute::parse_nested_meta`
//! rather than `darling` — the attribute surface here (a handful of
//! `key = "value"` pairs per attribute) does not need a general-purpose
//! attribute-parsing crate, and staying off it keeps this crate's
//! dependency footprint to exactly `syn`/`quote`/`proc-macro2`.
//!
//! Generated code refers to the core crate through the absolute path
//! `::epochstore_core::...` so it resolves the same way regardless of
//! whether the caller renamed their `use` imports.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::spanned::Spanned;
use syn::{parse_macro_input, Data, DeriveInput, Fields, LitStr, Type};

#[proc_macro_derive(
    Entity,
    attributes(
        entity,
        column,
        primary_key,
        index,
        foreign_key,
        unique,
        check,
        computed,
        not_mapped,
        encrypted,
        json_converter,
        audit_field
    )
)]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input).unwrap_or_else(|e| e.to_compile_error()).into()
}

struct EntityAttrs {
    table: String,
    schema: Option<String>,
}

fn parse_entity_attrs(input: &DeriveInput) -> syn::Result<EntityAttrs> {
    let mut table = None;
    let mut schema = None;
    for attr in &input.attrs {
        if !attr.path().is_ident("entity") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                table = Some(s.value());
            } else if meta.path.is_ident("schema") {
                let value = meta.value()?;
                let s: LitStr = value.parse()?;
                schema = Some(s.value());
            }
            Ok(())
        })?;
    }
    let table = table.ok_or_else(|| {
        syn::Error::new(input.span(), "#[derive(Entity)] requires #[entity(table = \"...\")]")
    })?;
    Ok(EntityAttrs { table, schema })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditKind {
    CreatedTime,
    LastWriteTime,
    Version,
    IsDeleted,
    CreatedBy,
    LastWriteBy,
    ExpirationTime,
}

struct FieldPlan {
    ident: syn::Ident,
    column: String,
    ty: Type,
    nullable: bool,
    unique: bool,
    primary_key: bool,
    not_mapped: bool,
    audit: Option<AuditKind>,
    check: Option<String>,
    index: Option<(String, u32)>,
    order: u32,
}

fn parse_field(order: u32, field: &syn::Field) -> syn::Result<FieldPlan> {
    let ident = field.ident.clone().ok_or_else(|| syn::Error::new(field.span(), "Entity fields must be named"))?;
    let mut column = ident.to_string();
    let mut unique = false;
    let mut primary_key = false;
    let mut not_mapped = false;
    let mut audit = None;
    let mut check = None;
    let mut index = None;

    for attr in &field.attrs {
        if attr.path().is_ident("column") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value = meta.value()?;
                    let s: LitStr = value.parse()?;
                    column = s.value();
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("primary_key") {
            primary_key = true;
        } else if attr.path().is_ident("unique") {
            unique = true;
        } else if attr.path().is_ident("not_mapped") {
            not_mapped = true;
        } else if attr.path().is_ident("check") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("expr") {
                    let value = meta.value()?;
                    let s: LitStr = value.parse()?;
                    check = Some(s.value());
                }
                Ok(())
            })?;
        } else if attr.path().is_ident("index") {
            let mut name = None;
            let mut idx_order = 0u32;
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("name") {
                    let value = meta.value()?;
                    let s: LitStr = value.parse()?;
                    name = Some(s.value());
                } else if meta.path.is_ident("order") {
                    let value = meta.value()?;
                    let lit: syn::LitInt = value.parse()?;
                    idx_order = lit.base10_parse()?;
                }
                Ok(())
            })?;
            if let Some(name) = name {
                index = Some((name, idx_order));
            }
        } else if attr.path().is_ident("audit_field") {
            attr.parse_nested_meta(|meta| {
                let kind = if meta.path.is_ident("created_time") {
                    Some(AuditKind::CreatedTime)
                } else if meta.path.is_ident("last_write_time") {
                    Some(AuditKind::LastWriteTime)
                } else if meta.path.is_ident("version") {
                    Some(AuditKind::Version)
                } else if meta.path.is_ident("is_deleted") {
                    Some(AuditKind::IsDeleted)
                } else if meta.path.is_ident("created_by") {
                    Some(AuditKind::CreatedBy)
                } else if meta.path.is_ident("last_write_by") {
                    Some(AuditKind::LastWriteBy)
                } else if meta.path.is_ident("expiration_time") {
                    Some(AuditKind::ExpirationTime)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    audit = Some(kind);
                }
                Ok(())
            })?;
        }
    }

    let (ty, nullable) = unwrap_option(field.ty.clone());
    Ok(FieldPlan { ident, column, ty, nullable, unique, primary_key, not_mapped, audit, check, index, order })
}

fn unwrap_option(ty: Type) -> (Type, bool) {
    if let Type::Path(p) = &ty {
        if let Some(seg) = p.path.segments.last() {
            if seg.ident == "Option" {
                if let syn::PathArguments::AngleBracketed(args) = &seg.arguments {
                    if let Some(syn::GenericArgument::Type(inner)) = args.args.first() {
                        return (inner.clone(), true);
                    }
                }
            }
        }
    }
    (ty, false)
}

fn sql_type_tokens(ty: &Type) -> TokenStream2 {
    let name = match ty {
        Type::Path(p) => p.path.segments.last().map(|s| s.ident.to_string()),
        _ => None,
    };
    match name.as_deref() {
        Some("String") | Some("str") => quote! { ::epochstore_core::metadata::SqlType::Text },
        Some("Vec") => quote! { ::epochstore_core::metadata::SqlType::Blob },
        Some("f32") | Some("f64") => quote! { ::epochstore_core::metadata::SqlType::Real },
        Some("bool") | Some("i8") | Some("i16") | Some("i32") | Some("i64") | Some("isize")
        | Some("u8") | Some("u16") | Some("u32") | Some("u64") | Some("usize") => {
            quote! { ::epochstore_core::metadata::SqlType::Integer }
        }
        _ => quote! { ::epochstore_core::metadata::SqlType::Text },
    }
}

fn audit_role_tokens(kind: AuditKind) -> TokenStream2 {
    match kind {
        AuditKind::CreatedTime => quote! { Some(::epochstore_core::metadata::AuditRole::CreatedTime) },
        AuditKind::LastWriteTime => quote! { Some(::epochstore_core::metadata::AuditRole::LastWriteTime) },
        AuditKind::Version => quote! { Some(::epochstore_core::metadata::AuditRole::Version) },
        AuditKind::IsDeleted => quote! { Some(::epochstore_core::metadata::AuditRole::IsDeleted) },
        AuditKind::CreatedBy => quote! { Some(::epochstore_core::metadata::AuditRole::CreatedBy) },
        AuditKind::LastWriteBy => quote! { Some(::epochstore_core::metadata::AuditRole::LastWriteBy) },
        AuditKind::ExpirationTime => quote! { Some(::epochstore_core::metadata::AuditRole::ExpirationTime) },
    }
}

fn expand(input: DeriveInput) -> syn::Result<TokenStream2> {
    let entity_attrs = parse_entity_attrs(&input)?;
    let struct_ident = input.ident.clone();

    let fields = match &input.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(named) => &named.named,
            _ => return Err(syn::Error::new(input.span(), "#[derive(Entity)] requires named fields")),
        },
        _ => return Err(syn::Error::new(input.span(), "#[derive(Entity)] only supports structs")),
    };

    let mut plans = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        plans.push(parse_field(i as u32, field)?);
    }
    let mapped: Vec<&FieldPlan> = plans.iter().filter(|p| !p.not_mapped).collect();

    let version_field = mapped
        .iter()
        .find(|p| p.audit == Some(AuditKind::Version))
        .ok_or_else(|| syn::Error::new(input.span(), "one field must carry #[audit_field(version)]"))?;
    let is_deleted_field = mapped
        .iter()
        .find(|p| p.audit == Some(AuditKind::IsDeleted))
        .ok_or_else(|| syn::Error::new(input.span(), "one field must carry #[audit_field(is_deleted)]"))?;
    let created_time_field = mapped
        .iter()
        .find(|p| p.audit == Some(AuditKind::CreatedTime))
        .ok_or_else(|| syn::Error::new(input.span(), "one field must carry #[audit_field(created_time)]"))?;
    let last_write_time_field = mapped
        .iter()
        .find(|p| p.audit == Some(AuditKind::LastWriteTime))
        .ok_or_else(|| syn::Error::new(input.span(), "one field must carry #[audit_field(last_write_time)]"))?;

    let pk_fields: Vec<&&FieldPlan> = mapped.iter().filter(|p| p.primary_key).collect();
    if pk_fields.is_empty() {
        return Err(syn::Error::new(input.span(), "at least one field must carry #[primary_key]"));
    }
    let key_field = pk_fields
        .iter()
        .find(|p| p.ident != version_field.ident)
        .ok_or_else(|| syn::Error::new(input.span(), "primary key must include a non-version column"))?;
    let key_ty = &key_field.ty;

    let table = &entity_attrs.table;
    let schema_tokens = match &entity_attrs.schema {
        Some(s) => quote! { Some(#s) },
        None => quote! { None },
    };

    let column_tokens: Vec<TokenStream2> = mapped
        .iter()
        .map(|p| {
            let name = &p.column;
            let sql_type = sql_type_tokens(&p.ty);
            let nullable = p.nullable;
            let unique = p.unique;
            let order = p.order;
            let audit_role = match p.audit {
                Some(k) => audit_role_tokens(k),
                None => quote! { None },
            };
            let check_tokens = match &p.check {
                Some(expr) => quote! { Some(::epochstore_core::metadata::CheckSpec { name: None, expr: #expr }) },
                None => quote! { None },
            };
            quote! {
                ::epochstore_core::metadata::ColumnDescriptor {
                    name: #name,
                    sql_type: #sql_type,
                    nullable: #nullable,
                    default: None,
                    unique: #unique,
                    order: #order,
                    audit_role: #audit_role,
                    check: #check_tokens,
                    computed: None,
                    encrypted: None,
                    json_converter: false,
                }
            }
        })
        .collect();

    let pk_columns: Vec<&str> = pk_fields.iter().map(|p| p.column.as_str()).collect();
    let pk_column_tokens = quote! { vec![#(#pk_columns),*] };

    let mut index_groups: std::collections::BTreeMap<String, Vec<(&str, u32)>> = std::collections::BTreeMap::new();
    for p in &mapped {
        if let Some((name, order)) = &p.index {
            index_groups.entry(name.clone()).or_default().push((p.column.as_str(), *order));
        }
    }
    let index_tokens: Vec<TokenStream2> = index_groups
        .into_iter()
        .map(|(name, mut cols)| {
            cols.sort_by_key(|(_, o)| *o);
            let col_tokens: Vec<TokenStream2> = cols
                .iter()
                .map(|(n, o)| quote! { ::epochstore_core::metadata::IndexColumn { name: #n, order: #o } })
                .collect();
            quote! {
                ::epochstore_core::metadata::IndexDescriptor {
                    name: #name.to_string(),
                    columns: vec![#(#col_tokens),*],
                    unique: false,
                    filter: None,
                }
            }
        })
        .collect();

    let bind_tokens: Vec<TokenStream2> = mapped
        .iter()
        .map(|p| {
            let ident = &p.ident;
            let name = format!(":{}", p.column);
            quote! { (#name, &self.#ident as &dyn ::rusqlite::types::ToSql) }
        })
        .collect();

    let from_row_tokens: Vec<TokenStream2> = mapped
        .iter()
        .map(|p| {
            let ident = &p.ident;
            let name = &p.column;
            quote! { #ident: row.get(#name)? }
        })
        .collect();

    let key_ident = &key_field.ident;
    let version_ident = &version_field.ident;
    let is_deleted_ident = &is_deleted_field.ident;

    let created_time_ident = &created_time_field.ident;
    let created_time_impl = quote! {
        fn created_time(&self) -> i64 { self.#created_time_ident }
        fn set_created_time(&mut self, t: i64) { self.#created_time_ident = t; }
    };
    let last_write_time_ident = &last_write_time_field.ident;
    let last_write_time_impl = quote! {
        fn last_write_time(&self) -> i64 { self.#last_write_time_ident }
        fn set_last_write_time(&mut self, t: i64) { self.#last_write_time_ident = t; }
    };

    let expiration_time_field = mapped.iter().find(|p| p.audit == Some(AuditKind::ExpirationTime));
    let expiration_time_impl = match expiration_time_field {
        Some(f) if f.nullable => {
            let ident = &f.ident;
            quote! { fn expiration_time(&self) -> Option<i64> { self.#ident } }
        }
        Some(f) => {
            let ident = &f.ident;
            quote! { fn expiration_time(&self) -> Option<i64> { Some(self.#ident) } }
        }
        None => quote! {},
    };

    let static_ident = format_ident!("__{}_DESCRIPTOR", struct_ident.to_string().to_uppercase());

    let expanded = quote! {
        #[doc(hidden)]
        static #static_ident: ::std::sync::OnceLock<::epochstore_core::metadata::EntityDescriptor> = ::std::sync::OnceLock::new();

        impl ::epochstore_core::metadata::Entity for #struct_ident {
            type Key = #key_ty;

            fn descriptor() -> &'static ::epochstore_core::metadata::EntityDescriptor {
                #static_ident.get_or_init(|| ::epochstore_core::metadata::EntityDescriptor {
                    table: #table,
                    schema: #schema_tokens,
                    columns: vec![#(#column_tokens),*],
                    primary_key: ::epochstore_core::metadata::PrimaryKeyDescriptor {
                        columns: #pk_column_tokens,
                        auto_increment: false,
                    },
                    indexes: vec![#(#index_tokens),*],
                    foreign_keys: vec![],
                })
            }

            fn key(&self) -> Self::Key {
                self.#key_ident.clone()
            }
            fn version(&self) -> u64 {
                self.#version_ident as u64
            }
            fn set_version(&mut self, version: u64) {
                self.#version_ident = version as _;
            }
            fn is_deleted(&self) -> bool {
                self.#is_deleted_ident
            }
            fn set_deleted(&mut self, deleted: bool) {
                self.#is_deleted_ident = deleted;
            }
            #created_time_impl
            #last_write_time_impl
            #expiration_time_impl
        }

        impl ::epochstore_core::metadata::Mapper for #struct_ident {
            fn bind_named(&self) -> Vec<(&'static str, &dyn ::rusqlite::types::ToSql)> {
                vec![#(#bind_tokens),*]
            }

            fn from_row(row: &::rusqlite::Row<'_>) -> ::rusqlite::Result<Self> {
                Ok(Self { #(#from_row_tokens),* })
            }
        }
    };

    Ok(expanded)
}
