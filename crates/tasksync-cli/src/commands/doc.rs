//! Document command handlers

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;

use tasksync_core::{Document, SyncEngine};

use crate::output::Output;

/// Create or update a document from key=value pairs
pub fn put(engine: &SyncEngine, id: String, fields: Vec<String>, output: &Output) -> Result<()> {
    let store = engine.store();
    let mut doc = store
        .get(&id)?
        .unwrap_or_else(|| Document::new(id.clone()));

    for field in &fields {
        let (key, value) = parse_field(field)?;
        doc.set(key, value);
    }
    doc.touch(Utc::now());

    let stored = store
        .put(&doc)
        .with_context(|| format!("Failed to write document '{}'", id))?;

    if output.is_quiet() {
        output.print_document(&stored);
    } else {
        output.success(&format!(
            "Stored {} at revision {}",
            stored.id,
            stored.rev.as_deref().unwrap_or_default()
        ));
    }
    Ok(())
}

/// Show a document
pub fn get(engine: &SyncEngine, id: String, output: &Output) -> Result<()> {
    match engine.store().get(&id)? {
        Some(doc) => {
            output.print_document(&doc);
            Ok(())
        }
        None => bail!("Document not found: {}", id),
    }
}

/// Delete a document
pub fn delete(engine: &SyncEngine, id: String, output: &Output) -> Result<()> {
    let store = engine.store();
    let Some(doc) = store.get(&id)? else {
        bail!("Document not found: {}", id);
    };
    let rev = doc.rev.unwrap_or_default();
    store
        .delete(&id, &rev)
        .with_context(|| format!("Failed to delete document '{}'", id))?;

    output.success(&format!("Deleted {}", id));
    Ok(())
}

/// Split `key=value`; the value is JSON if it parses, a string otherwise
fn parse_field(field: &str) -> Result<(String, Value)> {
    let Some((key, raw)) = field.split_once('=') else {
        bail!("Invalid field '{}'. Use key=value", field);
    };
    let key = key.trim();
    if key.is_empty() || key.starts_with('_') {
        bail!("Invalid field name '{}'", key);
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
