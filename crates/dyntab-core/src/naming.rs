//! Identifier derivation and validation.
//!
//! Every physical identifier string (table, index, temp table) is built here.
//! Nothing in this module touches the database.

use crate::error::{Error, Result};

/// Prefix of every physical table name.
pub const PHYSICAL_TABLE_PREFIX: &str = "dyn_";

/// Primary key column of every physical table.
pub const PRIMARY_KEY_COLUMN: &str = "id";

/// Columns every physical table carries; user fields may not use these names.
pub const SYSTEM_COLUMNS: [&str; 3] = [PRIMARY_KEY_COLUMN, "created_at", "updated_at"];

/// Maximum length of a field (column) name.
pub const MAX_FIELD_NAME_LEN: usize = 63;

/// Maximum length of a table display name.
pub const MAX_TABLE_NAME_LEN: usize = 64;

/// Physical name for a table, derived solely from its id.
pub fn physical_table_name(table_id: u64) -> String {
    format!("{PHYSICAL_TABLE_PREFIX}{table_id}")
}

/// Check an identifier against `^[a-z][a-z0-9_]*$` and the length limit.
pub fn identifier_is_valid(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    name.len() <= MAX_FIELD_NAME_LEN
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Normalize user input into an identifier.
///
/// Lower-cases, turns whitespace and dashes into underscores and drops every
/// other character outside `[a-z0-9_]`.
pub fn sanitize_identifier(raw: &str) -> Result<String> {
    let sanitized: String = raw
        .trim()
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            match c {
                'a'..='z' | '0'..='9' | '_' => Some(c),
                '-' => Some('_'),
                c if c.is_whitespace() => Some('_'),
                _ => None,
            }
        })
        .collect();

    if sanitized.is_empty() {
        return Err(Error::Validation(format!(
            "{raw:?} contains no identifier characters"
        )));
    }
    if !identifier_is_valid(&sanitized) {
        return Err(Error::Validation(format!(
            "{sanitized:?} is not a valid identifier (must start with a letter, at most {MAX_FIELD_NAME_LEN} chars)"
        )));
    }
    Ok(sanitized)
}

/// Check if a column name is reserved for system use.
pub fn is_system_column(name: &str) -> bool {
    SYSTEM_COLUMNS.contains(&name)
}

/// Validate a field name: identifier grammar and not a system column.
pub fn validate_field_name(name: &str) -> Result<()> {
    if !identifier_is_valid(name) {
        return Err(Error::Validation(format!(
            "field name {name:?} must match ^[a-z][a-z0-9_]*$ and be at most {MAX_FIELD_NAME_LEN} chars"
        )));
    }
    if is_system_column(name) {
        return Err(Error::Validation(format!(
            "field name {name:?} is reserved"
        )));
    }
    Ok(())
}

/// Validate a table display name.
pub fn validate_table_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation("table name can't be blank".to_string()));
    }
    if trimmed.chars().count() > MAX_TABLE_NAME_LEN {
        return Err(Error::Validation(format!(
            "table name is too long (maximum is {MAX_TABLE_NAME_LEN} characters)"
        )));
    }
    if trimmed.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(Error::Validation(
            "table name cannot start with a number".to_string(),
        ));
    }
    Ok(())
}

/// Validate an API identifier.
pub fn validate_api_identifier(identifier: &str) -> Result<()> {
    if identifier_is_valid(identifier) {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "api identifier {identifier:?} must match ^[a-z][a-z0-9_]*$"
        )))
    }
}

/// Longest identifier PostgreSQL keeps without truncating.
const MAX_INDEX_NAME_LEN: usize = 63;

/// Name of the unique index on `column` of `physical`.
///
/// Names that would exceed [`MAX_INDEX_NAME_LEN`] are cut short and end in
/// eight hex digits of a blake3 digest of the full name.
pub fn unique_index_name(physical: &str, column: &str) -> String {
    let name = format!("uidx_{physical}_{column}");
    if name.len() <= MAX_INDEX_NAME_LEN {
        return name;
    }
    let digest = blake3::hash(name.as_bytes()).to_hex();
    let suffix = &digest.as_str()[..8];
    let mut cut = MAX_INDEX_NAME_LEN - suffix.len() - 1;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{suffix}", &name[..cut])
}

/// Recover the column from an index named by [`unique_index_name`].
pub fn column_from_index_name<'a>(index: &'a str, physical: &str) -> Option<&'a str> {
    index
        .strip_prefix("uidx_")?
        .strip_prefix(physical)?
        .strip_prefix('_')
        .filter(|c| !c.is_empty() && unique_index_name(physical, c) == index)
}

/// Name of the scratch table used while rebuilding `physical`.
pub fn temp_table_name(physical: &str, suffix: &str) -> String {
    format!("{physical}_tmp_{suffix}")
}

/// Check whether `name` is a scratch table of `physical`.
pub fn is_temp_table_of(name: &str, physical: &str) -> bool {
    name.strip_prefix(physical)
        .is_some_and(|rest| rest.starts_with("_tmp_"))
}

/// Quote an identifier for interpolation into SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
