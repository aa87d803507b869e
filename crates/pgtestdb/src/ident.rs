//! Identifier validation, quoting and clone-name generation.
//!
//! Role and database names cannot be bound as statement parameters, so they
//! are interpolated into SQL text. Every name passes through [`validate`]
//! before it reaches a statement, and only [`quote`] renders it.

use uuid::Uuid;

use crate::{Error, Result};

/// PostgreSQL truncates identifiers longer than `NAMEDATALEN - 1` bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Length of the random suffix appended to clone names.
pub const CLONE_SUFFIX_LEN: usize = 16;

/// Longest template name that still leaves room for `_` plus the suffix.
pub const MAX_TEMPLATE_NAME_LEN: usize = MAX_IDENTIFIER_LEN - 1 - CLONE_SUFFIX_LEN;

/// Checks that `name` only uses ASCII letters, digits and underscores.
pub fn validate(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidIdentifier {
            name: name.to_string(),
            reason,
        })
    };

    let Some(first) = name.chars().next() else {
        return invalid("must not be empty");
    };
    if name.len() > MAX_IDENTIFIER_LEN {
        return invalid("longer than 63 bytes");
    }
    if first.is_ascii_digit() {
        return invalid("must not start with a digit");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return invalid("only ASCII letters, digits and '_' are allowed");
    }
    Ok(())
}

/// Like [`validate`], additionally reserving room for a clone suffix.
pub fn validate_template_name(name: &str) -> Result<()> {
    validate(name)?;
    if name.len() > MAX_TEMPLATE_NAME_LEN {
        return Err(Error::InvalidIdentifier {
            name: name.to_string(),
            reason: "template names are limited to 46 bytes",
        });
    }
    Ok(())
}

/// Renders a validated name as a quoted SQL identifier.
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Renders a value as a single-quoted SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Random lowercase suffix of [`CLONE_SUFFIX_LEN`] characters (~75 bits).
pub fn random_suffix() -> String {
    let mut bits = Uuid::new_v4().as_u128();
    let mut suffix = String::with_capacity(CLONE_SUFFIX_LEN);
    for _ in 0..CLONE_SUFFIX_LEN {
        suffix.push(char::from(b'a' + (bits % 26) as u8));
        bits /= 26;
    }
    suffix
}

/// Fresh database name for a clone of `template`.
pub fn clone_name(template: &str) -> String {
    format!("{template}_{}", random_suffix())
}
