//! Item index (`contents.js`): one metadata row per item.
//!
//! Each row is a JSON array:
//!
//! ```text
//! [uuid, typeName, title, location, updatedAt, folderUuid, passwordStrength, trashed]
//! ```
//!
//! `trashed` is `"Y"` or `"N"`. Rows may be shorter (optional columns
//! missing) or longer (unknown trailing columns); both are accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeychainError;
use crate::item::{trim_trailing_nuls, ItemType};

const MIN_ROW_LEN: usize = 3;

/// Index metadata for one item. Readable without unlocking.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    /// Stable identity, assigned at creation and never mutated.
    pub uuid: String,
    pub title: String,
    pub item_type: ItemType,
    /// Primary location (usually a URL).
    pub location: String,
    pub trashed: bool,
    /// Last update, Unix seconds.
    pub updated_at: u64,
    pub folder_uuid: Option<String>,
}

/// Parse a `contents.js` item index.
///
/// # Errors
///
/// Returns `KeychainError::Format` if the document is not an array of rows
/// or a row lacks its uuid, type or title.
pub fn read_item_index(bytes: &[u8]) -> Result<Vec<ItemMetadata>, KeychainError> {
    let rows: Vec<Vec<Value>> = serde_json::from_slice(trim_trailing_nuls(bytes))
        .map_err(|e| KeychainError::Format(format!("invalid item index: {e}")))?;

    rows.iter().map(|row| parse_row(row)).collect()
}

/// Serialize an item index.
///
/// # Errors
///
/// Returns `KeychainError::Format` if JSON serialization fails.
pub fn write_item_index(items: &[ItemMetadata]) -> Result<Vec<u8>, KeychainError> {
    let rows: Vec<Value> = items
        .iter()
        .map(|item| {
            serde_json::json!([
                item.uuid,
                item.item_type.type_name(),
                item.title,
                item.location,
                item.updated_at,
                item.folder_uuid.as_deref().unwrap_or_default(),
                0,
                if item.trashed { "Y" } else { "N" },
            ])
        })
        .collect();

    serde_json::to_vec(&rows)
        .map_err(|e| KeychainError::Format(format!("failed to serialize item index: {e}")))
}

fn parse_row(row: &[Value]) -> Result<ItemMetadata, KeychainError> {
    if row.len() < MIN_ROW_LEN {
        return Err(KeychainError::Format(format!(
            "item index row has {} columns (minimum {MIN_ROW_LEN})",
            row.len()
        )));
    }

    let uuid = text(row.first());
    if uuid.is_empty() {
        return Err(KeychainError::Format("item index row without uuid".into()));
    }

    let folder = text(row.get(5));
    Ok(ItemMetadata {
        uuid,
        item_type: ItemType::from(text(row.get(1))),
        title: text(row.get(2)),
        location: text(row.get(3)),
        updated_at: timestamp(row.get(4)),
        folder_uuid: (!folder.is_empty()).then_some(folder),
        trashed: matches!(row.get(7), Some(Value::String(s)) if s == "Y")
            || matches!(row.get(7), Some(Value::Bool(true))),
    })
}

fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn timestamp(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_default(),
        Some(Value::String(s)) => s.parse().unwrap_or_default(),
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
