//! Identifier sanitizer.
//!
//! Every name that ends up inside a storage command is an [`Identifier`], and
//! the only ways to build one are the functions in this module. Identifiers
//! are restricted to `[a-z0-9_]`, start with a letter or underscore and are
//! at most [`MAX_IDENTIFIER_LEN`] bytes long, so quoting them is trivial and
//! no escaping is ever required.

use std::collections::HashSet;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::error::EngineError;

pub const MAX_IDENTIFIER_LEN: usize = 63;
pub const MAX_SLUG_LEN: usize = 200;
const MAX_TABLE_BASE_LEN: usize = 48;
const TABLE_PREFIX: &str = "ds_";

/// Names that collide with the system primary key, SQLite row aliases or the
/// reserved list parameters of the CRUD surface.
pub const RESERVED_FIELD_NAMES: &[&str] = &[
    "id", "pk", "rowid", "oid", "_rowid_", "page", "page_size", "ordering",
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(String);

impl Identifier {
    /// Re-admits a name read back from the metadata store. Anything that is not
    /// already in sanitized form is treated as an invariant violation.
    pub fn from_stored(name: &str) -> Result<Self, EngineError> {
        if is_sanitized(name) {
            Ok(Identifier(name.to_string()))
        } else {
            Err(EngineError::internal(format!(
                "stored identifier {:?} is not in sanitized form",
                name
            )))
        }
    }

    pub(crate) fn system_id() -> Self {
        Identifier("id".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form for interpolation into a storage command.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Identifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn is_sanitized(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !name.as_bytes()[0].is_ascii_digit()
}

/// Lower-cases and collapses every run of non-alphanumeric characters into
/// `separator`, trimming it from both ends.
fn collapse(input: &str, separator: char) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending = false;
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending && !out.is_empty() {
                out.push(separator);
            }
            pending = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending = true;
        }
    }
    out
}

fn truncate(mut name: String, max: usize) -> String {
    if name.len() > max {
        name.truncate(max);
        while name.ends_with('_') || name.ends_with('-') {
            name.pop();
        }
    }
    name
}

/// Sanitizes a single display name. Empty and reserved results become the
/// positional placeholder `field_<position>`.
pub fn sanitize_field_name(display: &str, position: usize) -> Identifier {
    let mut name = collapse(display, '_');
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        name = format!("col_{}", name);
    }
    let name = truncate(name, MAX_IDENTIFIER_LEN);
    if name.is_empty() || RESERVED_FIELD_NAMES.contains(&name.as_str()) {
        return Identifier(format!("field_{}", position));
    }
    Identifier(name)
}

/// Sanitizes all headers of one dataset in column order, resolving collisions
/// with `_2`, `_3`, ... suffixes.
pub fn sanitize_field_names<S: AsRef<str>>(headers: &[S]) -> Vec<Identifier> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut result = Vec::with_capacity(headers.len());

    for (position, header) in headers.iter().enumerate() {
        let base = sanitize_field_name(header.as_ref(), position).0;
        let mut candidate = base.clone();
        let mut counter = 2;
        while taken.contains(&candidate) {
            let suffix = format!("_{}", counter);
            candidate = format!(
                "{}{}",
                truncate(base.clone(), MAX_IDENTIFIER_LEN - suffix.len()),
                suffix
            );
            counter += 1;
        }
        taken.insert(candidate.clone());
        result.push(Identifier(candidate));
    }

    result
}

/// URL-safe slug for a dataset name.
pub fn slugify(name: &str) -> String {
    let slug = truncate(collapse(name, '-'), MAX_SLUG_LEN);
    if slug.is_empty() {
        "dataset".to_string()
    } else {
        slug
    }
}

/// Deterministic physical table name for a slug: `ds_<slug>` with dashes
/// turned into underscores.
pub fn table_name_for_slug(slug: &str) -> Identifier {
    let base = truncate(collapse(slug, '_'), MAX_TABLE_BASE_LEN);
    if base.is_empty() {
        return Identifier(format!("{}dataset", TABLE_PREFIX));
    }
    Identifier(format!("{}{}", TABLE_PREFIX, base))
}

/// Appends a short random suffix to a table name that is already taken.
pub fn with_random_suffix(table: &Identifier) -> Identifier {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Identifier(format!("{}_{}", table.0, &suffix[..6]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_sanitization() {
        assert_eq!(sanitize_field_name("Product Name", 0).as_str(), "product_name");
        assert_eq!(sanitize_field_name("Price ($)", 0).as_str(), "price");
        assert_eq!(sanitize_field_name("a___b___c", 0).as_str(), "a_b_c");
        assert_eq!(sanitize_field_name("1st_place", 0).as_str(), "col_1st_place");
    }

    #[test]
    fn reserved_and_empty_names_become_positional() {
        assert_eq!(sanitize_field_name("id", 3).as_str(), "field_3");
        assert_eq!(sanitize_field_name("ID", 0).as_str(), "field_0");
        assert_eq!(sanitize_field_name("page", 1).as_str(), "field_1");
        assert_eq!(sanitize_field_name("!!!", 7).as_str(), "field_7");
        assert_eq!(sanitize_field_name("", 2).as_str(), "field_2");
    }

    #[test]
    fn injection_payload_sanitizes_to_plain_identifier() {
        let name = sanitize_field_name("Robert'); DROP TABLE x;--", 0);
        assert_eq!(name.as_str(), "robert_drop_table_x");
        assert!(is_sanitized(name.as_str()));
        assert!(!name.quoted().contains('\''));
        assert!(!name.quoted().contains(';'));
    }

    #[test]
    fn collisions_get_numeric_suffixes_in_order() {
        let names = sanitize_field_names(&["Name", "name", "NAME!", "name_2"]);
        let names: Vec<&str> = names.iter().map(Identifier::as_str).collect();
        assert_eq!(names, vec!["name", "name_2", "name_3", "name_2_2"]);
    }

    #[test]
    fn long_names_are_truncated_with_room_for_suffix() {
        let long = "x".repeat(100);
        let names = sanitize_field_names(&[long.clone(), long]);
        assert_eq!(names[0].as_str().len(), MAX_IDENTIFIER_LEN);
        assert_eq!(names[1].as_str().len(), MAX_IDENTIFIER_LEN);
        assert!(names[1].as_str().ends_with("_2"));
    }

    #[test]
    fn non_ascii_letters_are_dropped() {
        assert_eq!(sanitize_field_name("Größe", 0).as_str(), "gr_e");
    }

    #[test]
    fn stored_identifiers_are_revalidated() {
        assert!(Identifier::from_stored("price").is_ok());
        assert!(Identifier::from_stored("price\"; --").is_err());
        assert!(Identifier::from_stored("9lives").is_err());
        assert!(Identifier::from_stored("").is_err());
    }

    #[test]
    fn slugs_and_table_names() {
        assert_eq!(slugify("My Test Dataset"), "my-test-dataset");
        assert_eq!(slugify("  ***  "), "dataset");
        assert_eq!(slugify("Sales 2024!"), "sales-2024");
        assert_eq!(table_name_for_slug("sales-2024").as_str(), "ds_sales_2024");
        let suffixed = with_random_suffix(&table_name_for_slug("sales"));
        assert!(suffixed.as_str().starts_with("ds_sales_"));
        assert_eq!(suffixed.as_str().len(), "ds_sales_".len() + 6);
        assert!(is_sanitized(suffixed.as_str()));
    }
}
