//! DDL assembly: identifier quoting, literal escaping, column-type
//! translation, and the CREATE/ALTER statement builders.
//!
//! The warehouse rejects parameter placeholders in DDL and COPY, so these
//! statements are assembled as strings. Everything interpolated goes
//! through [`quote_ident`] or [`escape_literal`], and NUL bytes are
//! rejected before any SQL is built.

use granary_core::{Error, Result};

use crate::ops::{Action, Operation};

/// Translates a registry logical type into the warehouse column type.
///
/// Functional types (`f@name@variant`) are looked up by the prefix before
/// the last `@`. Unrecognized logical types pass through verbatim.
#[must_use]
pub fn translate_column_type(logical: &str) -> &str {
    if let Some(mapped) = base_type(logical) {
        return mapped;
    }
    if logical.starts_with("f@") {
        if let Some(idx) = logical.rfind('@') {
            if let Some(mapped) = base_type(&logical[..idx]) {
                return mapped;
            }
        }
    }
    logical
}

fn base_type(logical: &str) -> Option<&'static str> {
    Some(match logical {
        "ipCity" => "varchar(64)",
        "ipCountry" => "varchar(2)",
        "ipRegion" => "varchar(64)",
        "ipAsn" => "varchar(128)",
        "ipAsnInteger" => "int",
        "f@timestamp" => "datetime",
        "userIDWithMapping" => "bigint",
        _ => return None,
    })
}

/// Double-quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Single-quotes a string literal, escaping backslashes and quotes.
#[must_use]
pub fn escape_literal(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('\'', "''");
    format!("'{escaped}'")
}

/// Rejects strings that cannot appear in assembled SQL.
pub fn reject_nul(what: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(Error::InvalidInput(format!("{what} contains a NUL byte")));
    }
    Ok(())
}

/// Renders the `"name" type options` fragment for an ADD operation.
fn column_definition(op: &Operation) -> Result<String> {
    let logical = op.metadata.get("column_type").ok_or_else(|| {
        Error::InvalidInput(format!(
            "add-column operation for {:?} is missing column_type",
            op.column
        ))
    })?;
    let options = op
        .metadata
        .get("column_options")
        .map(String::as_str)
        .unwrap_or_default();
    // Single-character options are artifacts of the registry's encoding.
    let options = if options.len() > 1 { options } else { "" };
    Ok(format!(
        "{} {}{}",
        quote_ident(&op.column),
        translate_column_type(logical),
        options
    ))
}

/// Builds the `CREATE TABLE` statement for a fresh table.
///
/// Returns `Ok(None)` when the operation list carries a `DropEvent`
/// sentinel: the registry says this stream is being dropped, so creation
/// must be a no-op. All other operations must be ADDs.
pub fn create_table_sql(table: &str, ops: &[Operation]) -> Result<Option<String>> {
    reject_nul("table name", table)?;
    let mut columns = Vec::with_capacity(ops.len());
    for op in ops {
        if op.action == Action::DropEvent {
            return Ok(None);
        }
        if op.action != Action::Add {
            return Err(Error::InvalidInput(format!(
                "table creation requires add operations, got {:?}",
                op.action
            )));
        }
        columns.push(column_definition(op)?);
    }
    Ok(Some(format!(
        "CREATE TABLE {}({});",
        quote_ident(table),
        columns.join(",")
    )))
}

/// Builds the `ALTER TABLE` statement for one migration step.
///
/// Sentinel operations produce `Ok(None)`: they advance the version
/// without emitting DDL.
pub fn alter_table_sql(table: &str, op: &Operation) -> Result<Option<String>> {
    reject_nul("table name", table)?;
    reject_nul("column name", &op.column)?;
    let sql = match op.action {
        Action::Add => format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column_definition(op)?
        ),
        Action::Delete => format!(
            "ALTER TABLE {} DROP COLUMN {} CASCADE",
            quote_ident(table),
            quote_ident(&op.column)
        ),
        Action::Rename => {
            let new_name = op.metadata.get("new_outbound").ok_or_else(|| {
                Error::InvalidInput(format!(
                    "rename operation for {:?} is missing new_outbound",
                    op.column
                ))
            })?;
            format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(&op.column),
                quote_ident(new_name)
            )
        }
        Action::RequestDropEvent | Action::DropEvent | Action::CancelDropEvent => return Ok(None),
    };
    Ok(Some(sql))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn translates_known_types() {
        assert_eq!(translate_column_type("ipCity"), "varchar(64)");
        assert_eq!(translate_column_type("ipCountry"), "varchar(2)");
        assert_eq!(translate_column_type("ipAsnInteger"), "int");
        assert_eq!(translate_column_type("userIDWithMapping"), "bigint");
    }

    #[test]
    fn translates_functional_types_by_prefix() {
        assert_eq!(translate_column_type("f@timestamp"), "datetime");
        assert_eq!(translate_column_type("f@timestamp@utc"), "datetime");
    }

    #[test]
    fn unknown_types_pass_through() {
        assert_eq!(translate_column_type("varchar(255)"), "varchar(255)");
        assert_eq!(translate_column_type("f@mystery@thing"), "f@mystery@thing");
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn literal_escaping() {
        assert_eq!(escape_literal("s3://bucket/key"), "'s3://bucket/key'");
        assert_eq!(escape_literal("it's"), "'it''s'");
        assert_eq!(escape_literal("back\\slash"), "'back\\\\slash'");
    }

    #[test]
    fn create_table_renders_all_columns() {
        let ops = vec![
            Operation::add("time", "f@timestamp@utc"),
            Operation::add("channel", "varchar(25)"),
        ];
        let sql = create_table_sql("chat_message", &ops)
            .expect("build")
            .expect("some");
        assert_eq!(
            sql,
            "CREATE TABLE \"chat_message\"(\"time\" datetime,\"channel\" varchar(25));"
        );
    }

    #[test]
    fn create_table_applies_column_options() {
        let mut op = Operation::add("user_id", "userIDWithMapping");
        op.metadata
            .insert("column_options".to_string(), " sortkey".to_string());
        let sql = create_table_sql("t", &[op]).expect("build").expect("some");
        assert_eq!(sql, "CREATE TABLE \"t\"(\"user_id\" bigint sortkey);");
    }

    #[test]
    fn drop_event_short_circuits_creation() {
        let ops = vec![Operation {
            action: Action::DropEvent,
            column: String::new(),
            metadata: HashMap::new(),
        }];
        assert!(create_table_sql("gone", &ops).expect("build").is_none());
    }

    #[test]
    fn create_table_rejects_non_add_operations() {
        let ops = vec![Operation {
            action: Action::Rename,
            column: "a".to_string(),
            metadata: HashMap::new(),
        }];
        assert!(create_table_sql("t", &ops).is_err());
    }

    #[test]
    fn alter_add_drop_rename() {
        let add = alter_table_sql("t", &Operation::add("c", "int"))
            .expect("build")
            .expect("some");
        assert_eq!(add, "ALTER TABLE \"t\" ADD COLUMN \"c\" int");

        let del = alter_table_sql(
            "t",
            &Operation {
                action: Action::Delete,
                column: "c".to_string(),
                metadata: HashMap::new(),
            },
        )
        .expect("build")
        .expect("some");
        assert_eq!(del, "ALTER TABLE \"t\" DROP COLUMN \"c\" CASCADE");

        let ren = alter_table_sql(
            "t",
            &Operation {
                action: Action::Rename,
                column: "old".to_string(),
                metadata: HashMap::from([("new_outbound".to_string(), "new".to_string())]),
            },
        )
        .expect("build")
        .expect("some");
        assert_eq!(ren, "ALTER TABLE \"t\" RENAME COLUMN \"old\" TO \"new\"");
    }

    #[test]
    fn sentinels_produce_no_ddl() {
        for action in [
            Action::RequestDropEvent,
            Action::DropEvent,
            Action::CancelDropEvent,
        ] {
            let op = Operation {
                action,
                column: String::new(),
                metadata: HashMap::new(),
            };
            assert!(alter_table_sql("t", &op).expect("build").is_none());
        }
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(create_table_sql("bad\0name", &[]).is_err());
        assert!(alter_table_sql("t", &Operation::add("bad\0col", "int")).is_err());
    }
}
