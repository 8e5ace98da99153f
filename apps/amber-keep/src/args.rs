// Author: Lukas Bower
// Purpose: Parse and rewrite session creation-argument strings.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Session argument strings of the form
//! `ram_quota=8192, cached=1, label="hello"`. The engine must preserve the
//! child's string byte for byte except for the `ram_quota` field, which is
//! readjusted upward by the bookkeeping overhead of the shadow record; the
//! original string is kept on the record for snapshot fidelity.

/// Read the string value of `key`, stripping one level of double quotes.
#[must_use]
pub fn string_value<'a>(args: &'a str, key: &str) -> Option<&'a str> {
    let raw = raw_value(args, key)?;
    Some(raw.strip_prefix('"').map_or(raw, |inner| {
        inner.strip_suffix('"').unwrap_or(inner)
    }))
}

/// Read the unsigned numeric value of `key`, defaulting to 0 when the key is
/// absent or malformed.
#[must_use]
pub fn unsigned_value(args: &str, key: &str) -> u64 {
    raw_value(args, key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Replace the value of `key`, appending the field when it is missing.
/// Every other byte of the argument string is preserved.
#[must_use]
pub fn set_value(args: &str, key: &str, value: &str) -> String {
    let mut fields: Vec<String> = split_fields(args).map(str::to_owned).collect();
    for field in &mut fields {
        if field_key(field) == Some(key) {
            *field = format!("{key}={value}");
            return fields.join(", ");
        }
    }
    fields.push(format!("{key}={value}"));
    fields.join(", ")
}

fn raw_value<'a>(args: &'a str, key: &str) -> Option<&'a str> {
    split_fields(args).find_map(|field| {
        if field_key(field) == Some(key) {
            field.splitn(2, '=').nth(1).map(str::trim)
        } else {
            None
        }
    })
}

fn field_key(field: &str) -> Option<&str> {
    field.splitn(2, '=').next().map(str::trim)
}

fn split_fields(args: &str) -> impl Iterator<Item = &str> {
    args.split(',').map(str::trim).filter(|f| !f.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_label_and_quota() {
        let args = "ram_quota=8192, cached=1, label=\"sheep_counter\"";
        assert_eq!(string_value(args, "label"), Some("sheep_counter"));
        assert_eq!(unsigned_value(args, "ram_quota"), 8192);
        assert_eq!(unsigned_value(args, "phys_start"), 0);
    }

    #[test]
    fn set_value_preserves_other_fields() {
        let args = "ram_quota=8192, cached=1, label=\"hello\"";
        let rewritten = set_value(args, "ram_quota", "9000");
        assert_eq!(rewritten, "ram_quota=9000, cached=1, label=\"hello\"");
        assert_eq!(string_value(&rewritten, "label"), Some("hello"));
    }

    #[test]
    fn set_value_appends_missing_key() {
        let rewritten = set_value("label=\"hello\"", "ram_quota", "4096");
        assert_eq!(unsigned_value(&rewritten, "ram_quota"), 4096);
        assert_eq!(string_value(&rewritten, "label"), Some("hello"));
    }

    #[test]
    fn missing_label_is_none() {
        assert_eq!(string_value("ram_quota=1", "label"), None);
    }
}
