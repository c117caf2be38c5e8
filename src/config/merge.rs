//! Layering one config file tier over the merged result of the tiers below.
//!
//! A tier is a mapping of known sections, each a mapping of fields. Fields
//! replace the value below them whole: `capability.command` and
//! `finalization.context` are never merged element by element.

use anyhow::{Result, bail};
use serde_json::{Map, Value};

/// Top-level sections a tier may set.
const SECTIONS: [&str; 4] = ["store", "queue", "capability", "finalization"];

/// Apply `tier` on top of `merged`.
///
/// The tier is checked before anything is written, so a rejected tier leaves
/// `merged` untouched. A `null` section or field means "not specified".
///
/// ```
/// use serde_json::json;
/// use doc_spawner::config::merge_tier;
///
/// let mut merged = json!({"queue": {"num_workers": 3, "max_depth": 5}});
/// merge_tier(&mut merged, json!({"queue": {"num_workers": 8}})).unwrap();
/// assert_eq!(merged, json!({"queue": {"num_workers": 8, "max_depth": 5}}));
///
/// assert!(merge_tier(&mut merged, json!({"queues": {"num_workers": 1}})).is_err());
/// ```
pub fn merge_tier(merged: &mut Value, tier: Value) -> Result<()> {
    let sections = match tier {
        Value::Null => return Ok(()),
        Value::Object(sections) => sections,
        other => bail!("expected a mapping of sections, found {}", kind(&other)),
    };

    for (name, fields) in &sections {
        if !SECTIONS.contains(&name.as_str()) {
            bail!(
                "unknown section '{}' (expected one of: {})",
                name,
                SECTIONS.join(", ")
            );
        }
        if !(fields.is_object() || fields.is_null()) {
            bail!("section '{}' must be a mapping, found {}", name, kind(fields));
        }
    }

    if !merged.is_object() {
        *merged = Value::Object(Map::new());
    }
    let Value::Object(target) = merged else {
        return Ok(());
    };

    for (name, fields) in sections {
        let Value::Object(fields) = fields else {
            continue;
        };
        let section = target
            .entry(name)
            .or_insert_with(|| Value::Object(Map::new()));
        if !section.is_object() {
            *section = Value::Object(Map::new());
        }
        if let Value::Object(section) = section {
            for (field, value) in fields {
                if !value.is_null() {
                    section.insert(field, value);
                }
            }
        }
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}
