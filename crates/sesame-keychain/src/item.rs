//! Item types, decrypted item content and the `.1password` item file codec.
//!
//! This module provides:
//! - [`ItemType`] — item kind tag with round-tripping unknown names
//! - [`ItemContent`] — decrypted payload: sections, URLs, form fields, notes
//! - [`ItemFile`] — one `<UUID>.1password` file (metadata + encrypted payload)
//! - [`read_item_content`] / [`write_item_content`] — item file ⇄ content
//! - [`generate_uuid`], [`current_epoch_secs`], [`location_host`] helpers
//!
//! Content is decrypted on demand and never cached by this crate.

use std::fmt;

use data_encoding::HEXUPPER;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::cipher::{CipherId, CryptoParams, SaltedBlob, ITEM_KEY_ROUNDS};
use crate::error::KeychainError;
use crate::index::ItemMetadata;
use crate::keys::{MasterKey, SecurityLevel};

// ---------------------------------------------------------------------------
// Item type
// ---------------------------------------------------------------------------

/// Kind of item, stored as a dotted type name (`webforms.WebForm`, ...).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ItemType {
    /// Website login.
    Login,
    /// Standalone password.
    Password,
    /// Free-form secure note.
    SecureNote,
    /// Credit card.
    CreditCard,
    /// Bank account.
    BankAccount,
    /// Personal identity.
    Identity,
    /// Email account.
    EmailAccount,
    /// Software license.
    SoftwareLicense,
    /// Wireless router.
    Router,
    /// Database credentials.
    Database,
    /// Folder.
    Folder,
    /// Saved search folder.
    SavedSearch,
    /// Placeholder for a deleted item.
    Tombstone,
    /// Any type name not listed above, kept verbatim.
    Unknown(String),
}

const TYPE_NAMES: &[(ItemType, &str)] = &[
    (ItemType::Login, "webforms.WebForm"),
    (ItemType::Password, "passwords.Password"),
    (ItemType::SecureNote, "securenotes.SecureNote"),
    (ItemType::CreditCard, "wallet.financial.CreditCard"),
    (ItemType::BankAccount, "wallet.financial.BankAccountUS"),
    (ItemType::Identity, "identities.Identity"),
    (ItemType::EmailAccount, "wallet.onlineservices.Email.v2"),
    (ItemType::SoftwareLicense, "wallet.computer.License"),
    (ItemType::Router, "wallet.computer.Router"),
    (ItemType::Database, "wallet.computer.Database"),
    (ItemType::Folder, "system.folder.Regular"),
    (ItemType::SavedSearch, "system.folder.SavedSearch"),
    (ItemType::Tombstone, "system.Tombstone"),
];

impl ItemType {
    /// Type name as written in keychain files.
    #[must_use]
    pub fn type_name(&self) -> &str {
        if let Self::Unknown(name) = self {
            return name;
        }
        TYPE_NAMES
            .iter()
            .find(|(kind, _)| kind == self)
            .map_or("", |(_, name)| name)
    }
}

impl From<String> for ItemType {
    fn from(name: String) -> Self {
        TYPE_NAMES
            .iter()
            .find(|(_, known)| *known == name)
            .map_or(Self::Unknown(name), |(kind, _)| kind.clone())
    }
}

impl From<&str> for ItemType {
    fn from(name: &str) -> Self {
        Self::from(name.to_owned())
    }
}

impl From<ItemType> for String {
    fn from(kind: ItemType) -> Self {
        match kind {
            ItemType::Unknown(name) => name,
            known => known.type_name().to_owned(),
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

// ---------------------------------------------------------------------------
// Item content
// ---------------------------------------------------------------------------

/// Kind of a section field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    #[default]
    #[serde(rename = "string")]
    Text,
    #[serde(rename = "concealed")]
    Concealed,
    #[serde(rename = "address")]
    Address,
    #[serde(rename = "date")]
    Date,
    #[serde(rename = "monthYear")]
    MonthYear,
    #[serde(rename = "URL")]
    Url,
    #[serde(rename = "cctype")]
    CardType,
    #[serde(rename = "phone")]
    Phone,
    #[serde(rename = "gender")]
    Gender,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "menu")]
    Menu,
    #[serde(other)]
    Other,
}

/// One labelled value inside a section.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemField {
    #[serde(rename = "k", default)]
    pub kind: FieldKind,
    #[serde(rename = "n", default)]
    pub name: String,
    #[serde(rename = "t", default)]
    pub title: String,
    /// Usually a string; addresses and dates use other JSON shapes.
    #[serde(rename = "v", default)]
    pub value: serde_json::Value,
}

impl ItemField {
    /// The value rendered as text.
    #[must_use]
    pub fn value_text(&self) -> String {
        json_text(&self.value)
    }
}

/// An ordered group of fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ItemField>,
}

/// A saved web form field (login items).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    /// HTML input type code: `T` text, `P` password, `E` email, `C` checkbox, ...
    #[serde(rename = "type", default)]
    pub field_type: String,
    /// `username` or `password` for the designated login fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub designation: Option<String>,
}

/// A URL attached to an item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUrl {
    #[serde(default)]
    pub label: String,
    pub url: String,
}

const USERNAME: &str = "username";
const PASSWORD: &str = "password";

/// Decrypted item payload.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<ItemSection>,
    #[serde(rename = "URLs", default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<ItemUrl>,
    #[serde(rename = "notesPlain", default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(rename = "fields", default, skip_serializing_if = "Vec::is_empty")]
    pub form_fields: Vec<FormField>,
    /// Top-level password of `passwords.Password` items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "htmlMethod", default, skip_serializing_if = "Option::is_none")]
    pub html_method: Option<String>,
    #[serde(rename = "htmlAction", default, skip_serializing_if = "Option::is_none")]
    pub html_action: Option<String>,
    #[serde(rename = "htmlID", default, skip_serializing_if = "Option::is_none")]
    pub html_id: Option<String>,
}

impl ItemContent {
    /// Parse decrypted payload JSON.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Integrity` if the plaintext is not valid
    /// content JSON.
    pub fn from_json(plaintext: &[u8]) -> Result<Self, KeychainError> {
        serde_json::from_slice(plaintext)
            .map_err(|e| KeychainError::Integrity(format!("decrypted payload is not valid JSON: {e}")))
    }

    /// Serialize to payload JSON. The buffer is zeroized on drop.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Format` if serialization fails.
    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, KeychainError> {
        serde_json::to_vec(self)
            .map(Zeroizing::new)
            .map_err(|e| KeychainError::Format(format!("failed to serialize item content: {e}")))
    }

    /// Username of a login: the form field designated `username`.
    #[must_use]
    pub fn account(&self) -> Option<&str> {
        self.designated(USERNAME).map(|f| f.value.as_str())
    }

    /// Password: the form field designated `password`, else the top-level
    /// password of password items.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.designated(PASSWORD)
            .map(|f| f.value.as_str())
            .or(self.password.as_deref())
    }

    /// Set the username, creating the designated field if needed.
    pub fn set_account(&mut self, value: &str) {
        self.set_designated(USERNAME, "T", value);
    }

    /// Set the password. Password items without form fields keep it at the
    /// top level.
    pub fn set_password(&mut self, value: &str) {
        if self.designated(PASSWORD).is_none() && self.password.is_some() {
            self.password = Some(value.to_owned());
            return;
        }
        self.set_designated(PASSWORD, "P", value);
    }

    /// Look up a value by form field name or section field title,
    /// case-insensitively. Form fields win.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<String> {
        let wanted = name.to_lowercase();
        if let Some(form) = self
            .form_fields
            .iter()
            .find(|f| f.name.to_lowercase() == wanted)
        {
            return Some(form.value.clone());
        }
        self.sections
            .iter()
            .flat_map(|s| s.fields.iter())
            .find(|f| f.title.to_lowercase() == wanted)
            .map(ItemField::value_text)
    }

    fn designated(&self, designation: &str) -> Option<&FormField> {
        self.form_fields
            .iter()
            .find(|f| f.designation.as_deref() == Some(designation))
    }

    fn set_designated(&mut self, designation: &str, field_type: &str, value: &str) {
        if let Some(field) = self
            .form_fields
            .iter_mut()
            .find(|f| f.designation.as_deref() == Some(designation))
        {
            value.clone_into(&mut field.value);
            return;
        }
        self.form_fields.push(FormField {
            id: String::new(),
            name: designation.to_owned(),
            value: value.to_owned(),
            field_type: field_type.to_owned(),
            designation: Some(designation.to_owned()),
        });
    }
}

impl fmt::Debug for ItemContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemContent")
            .field("sections", &self.sections.len())
            .field("urls", &self.urls.len())
            .field("form_fields", &self.form_fields.len())
            .field("notes", &"***")
            .finish_non_exhaustive()
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Item file
// ---------------------------------------------------------------------------

/// One `<UUID>.1password` item file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemFile {
    pub uuid: String,
    #[serde(default)]
    pub title: String,
    pub type_name: ItemType,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub location_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_uuid: Option<String>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(rename = "keyID", default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Base64 salted envelope of the content JSON.
    pub encrypted: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_contents: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ItemFile {
    /// Assemble an item file from metadata and an encrypted payload.
    pub fn from_parts(
        metadata: &ItemMetadata,
        key_id: &str,
        security_level: SecurityLevel,
        created_at: u64,
        payload: &SaltedBlob,
    ) -> Self {
        Self {
            uuid: metadata.uuid.clone(),
            title: metadata.title.clone(),
            type_name: metadata.item_type.clone(),
            location: metadata.location.clone(),
            location_key: location_host(&metadata.location).unwrap_or_default(),
            folder_uuid: metadata.folder_uuid.clone(),
            created_at,
            updated_at: metadata.updated_at,
            trashed: metadata.trashed,
            security_level,
            key_id: Some(key_id.to_owned()),
            encrypted: payload.to_base64(),
            open_contents: None,
        }
    }

    /// Parse an item file.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Format` for malformed JSON.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeychainError> {
        serde_json::from_slice(trim_trailing_nuls(bytes))
            .map_err(|e| KeychainError::Format(format!("invalid item file: {e}")))
    }

    /// Serialize the item file.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Format` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeychainError> {
        serde_json::to_vec(self)
            .map_err(|e| KeychainError::Format(format!("failed to serialize item file: {e}")))
    }

    /// Index metadata for this item.
    #[must_use]
    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            uuid: self.uuid.clone(),
            title: self.title.clone(),
            item_type: self.type_name.clone(),
            location: self.location.clone(),
            trashed: self.trashed,
            updated_at: self.updated_at,
            folder_uuid: self.folder_uuid.clone(),
        }
    }

    /// Encrypted payload with the parameters needed to decrypt it.
    ///
    /// # Errors
    ///
    /// Returns `KeychainError::Integrity` if the payload envelope is invalid.
    pub fn payload(&self) -> Result<(Vec<u8>, CryptoParams), KeychainError> {
        let blob = SaltedBlob::from_base64(&self.encrypted)?;
        let params = blob.params(CipherId::Aes128OpenSslKey, ITEM_KEY_ROUNDS);
        Ok((blob.ciphertext, params))
    }
}

/// Decrypt the content of an item file.
///
/// # Errors
///
/// Returns `KeychainError::InvalidKeyMaterial` if the item names a different
/// key, `KeychainError::Integrity` if decryption or JSON parsing fails.
pub fn read_item_content(bytes: &[u8], master: &MasterKey) -> Result<ItemContent, KeychainError> {
    let file = ItemFile::from_bytes(bytes)?;
    if let Some(key_id) = &file.key_id {
        if *key_id != master.identifier {
            return Err(KeychainError::InvalidKeyMaterial(format!(
                "item {} is encrypted with key {key_id}",
                file.uuid
            )));
        }
    }

    let (ciphertext, params) = file.payload()?;
    let plaintext = crate::cipher::decrypt(master.expose(), &ciphertext, &params)?;
    ItemContent::from_json(plaintext.expose())
}

/// Encrypt `content` and produce item file bytes for `metadata`.
///
/// # Errors
///
/// Returns `KeychainError::Format` if serialization fails.
pub fn write_item_content(
    metadata: &ItemMetadata,
    content: &ItemContent,
    master: &MasterKey,
    level: SecurityLevel,
    params: &CryptoParams,
) -> Result<Vec<u8>, KeychainError> {
    let plaintext = content.to_json()?;
    let payload = SaltedBlob::seal(master.expose(), &plaintext, params)?;
    ItemFile::from_parts(metadata, &master.identifier, level, metadata.updated_at, &payload)
        .to_bytes()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Generate a new item/key identifier: 16 random bytes as 32 uppercase
/// hex characters.
#[must_use]
pub fn generate_uuid() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    HEXUPPER.encode(&bytes)
}

/// Current time as seconds since the Unix epoch.
#[must_use]
pub fn current_epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Lowercased host of an item location. Locations without a scheme are
/// read as `https://` URLs.
#[must_use]
pub fn location_host(location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    let parsed = if location.contains("://") {
        url::Url::parse(location)
    } else {
        url::Url::parse(&format!("https://{location}"))
    };
    parsed
        .ok()?
        .host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_lowercase)
}

pub(crate) fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map_or(0, |i| i.saturating_add(1));
    &bytes[..end]
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
