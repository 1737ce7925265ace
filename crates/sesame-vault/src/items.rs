//! Item operations on a [`Vault`].
//!
//! Reads go through the index (`contents.js`); content is decrypted by the
//! key agent using the key id recorded in each item file. Every mutation
//! takes the vault's write queue so concurrent writers never interleave a
//! read-modify-write of the index.

use sesame_keychain::{
    current_epoch_secs, generate_uuid, CryptoParams, ItemContent, ItemFile, ItemMetadata,
    SaltedBlob,
};

use crate::error::VaultError;
use crate::lifecycle::Vault;
use crate::search::{filter_by_location, match_items, select_unique};

impl Vault {
    /// Items in index order, optionally filtered by `pattern`.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Format` if the index is corrupt.
    pub async fn list_items(&self, pattern: Option<&str>) -> Result<Vec<ItemMetadata>, VaultError> {
        let items = self.read_index().await?;
        Ok(match pattern {
            Some(pattern) => match_items(&items, pattern).into_iter().cloned().collect(),
            None => items,
        })
    }

    /// Resolve `pattern` to exactly one item.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::NotFound` or `VaultError::AmbiguousMatch`.
    pub async fn find_item(&self, pattern: &str) -> Result<ItemMetadata, VaultError> {
        select_unique(&self.read_index().await?, pattern)
    }

    /// Untrashed items whose location host matches `url`.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Format` if the index is corrupt.
    pub async fn items_for_location(&self, url: &str) -> Result<Vec<ItemMetadata>, VaultError> {
        let items = self.read_index().await?;
        Ok(filter_by_location(&items, url)
            .into_iter()
            .filter(|item| !item.trashed)
            .cloned()
            .collect())
    }

    /// Decrypt the content of item `uuid`.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Locked` if the item's key is not held,
    /// `VaultError::NotFound` for an unknown item, `VaultError::Integrity`
    /// if the payload does not decrypt, `VaultError::InvalidArgument` if
    /// `uuid` is not alphanumeric.
    pub async fn get_content(&self, uuid: &str) -> Result<ItemContent, VaultError> {
        let file = self.read_item_file(uuid).await?;
        self.decrypt_file(&file).await
    }

    /// Store a new item. An empty `metadata.uuid` is replaced with a fresh
    /// one; `updated_at` is set to now. Returns the stored metadata.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Locked` if the vault is locked,
    /// `VaultError::AlreadyExists` if the uuid is taken.
    pub async fn add_item(
        &self,
        mut metadata: ItemMetadata,
        content: &ItemContent,
    ) -> Result<ItemMetadata, VaultError> {
        self.ensure_unlocked().await?;
        let level = self.config.security_level;
        let key_id = self.session_key(level)?;

        if metadata.uuid.is_empty() {
            metadata.uuid = generate_uuid();
        } else {
            check_uuid(&metadata.uuid)?;
        }

        let _turn = self.queue.acquire().await;
        let mut items = self.read_index().await?;
        if items
            .iter()
            .any(|item| item.uuid.eq_ignore_ascii_case(&metadata.uuid))
        {
            return Err(VaultError::AlreadyExists(format!("item {}", metadata.uuid)));
        }

        metadata.updated_at = current_epoch_secs();
        let payload = self.seal_content(&key_id, content).await?;
        let file = ItemFile::from_parts(&metadata, &key_id, level, metadata.updated_at, &payload);

        // Content first: an index row never points at a missing file.
        self.storage
            .write(&self.item_path(&metadata.uuid), &file.to_bytes()?)
            .await?;
        items.push(metadata.clone());
        self.write_index(&items).await?;

        tracing::info!(vault = %self.path, uuid = %metadata.uuid, "item added");
        Ok(metadata)
    }

    /// Decrypt item `uuid`, apply `mutation` to its metadata and content,
    /// then re-encrypt under the same key. The uuid cannot be changed.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Locked` if the vault is locked,
    /// `VaultError::NotFound` for an unknown item.
    pub async fn edit_item<F>(&self, uuid: &str, mutation: F) -> Result<ItemMetadata, VaultError>
    where
        F: FnOnce(&mut ItemMetadata, &mut ItemContent) + Send,
    {
        self.ensure_unlocked().await?;
        let _turn = self.queue.acquire().await;

        let mut items = self.read_index().await?;
        let pos = index_position(&items, uuid)?;
        let file = self.read_item_file(&items[pos].uuid).await?;
        let key_id = self.key_id_for(&file)?;
        let mut content = self.decrypt_file(&file).await?;

        let mut metadata = file.metadata();
        mutation(&mut metadata, &mut content);
        metadata.uuid.clone_from(&file.uuid);
        metadata.updated_at = current_epoch_secs();

        let payload = self.seal_content(&key_id, &content).await?;
        let updated = ItemFile {
            open_contents: file.open_contents.clone(),
            ..ItemFile::from_parts(
                &metadata,
                &key_id,
                file.security_level,
                file.created_at,
                &payload,
            )
        };
        self.storage
            .write(&self.item_path(&file.uuid), &updated.to_bytes()?)
            .await?;
        items[pos] = metadata.clone();
        self.write_index(&items).await?;

        tracing::info!(vault = %self.path, uuid = %file.uuid, "item updated");
        Ok(metadata)
    }

    /// Move item `uuid` to the trash. Content is untouched.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Locked` if the vault is locked,
    /// `VaultError::NotFound` for an unknown item.
    pub async fn trash_item(&self, uuid: &str) -> Result<ItemMetadata, VaultError> {
        self.set_trashed(uuid, true).await
    }

    /// Take item `uuid` out of the trash.
    ///
    /// # Errors
    ///
    /// Same as [`Vault::trash_item`].
    pub async fn restore_item(&self, uuid: &str) -> Result<ItemMetadata, VaultError> {
        self.set_trashed(uuid, false).await
    }

    /// Delete item `uuid` from the index and storage.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Locked` if the vault is locked,
    /// `VaultError::NotFound` for an unknown item.
    pub async fn remove_item(&self, uuid: &str) -> Result<(), VaultError> {
        self.ensure_unlocked().await?;
        let _turn = self.queue.acquire().await;

        let mut items = self.read_index().await?;
        let pos = index_position(&items, uuid)?;
        let removed = items.remove(pos);
        self.write_index(&items).await?;

        match self.storage.rm(&self.item_path(&removed.uuid)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                tracing::warn!(vault = %self.path, uuid = %removed.uuid, "item file left behind: {e}");
            }
        }

        tracing::info!(vault = %self.path, uuid = %removed.uuid, "item removed");
        Ok(())
    }

    async fn set_trashed(&self, uuid: &str, trashed: bool) -> Result<ItemMetadata, VaultError> {
        self.ensure_unlocked().await?;
        let _turn = self.queue.acquire().await;

        let mut items = self.read_index().await?;
        let pos = index_position(&items, uuid)?;
        let mut file = self.read_item_file(&items[pos].uuid).await?;
        if file.trashed == trashed && items[pos].trashed == trashed {
            return Ok(items[pos].clone());
        }

        file.trashed = trashed;
        self.storage
            .write(&self.item_path(&file.uuid), &file.to_bytes()?)
            .await?;
        items[pos].trashed = trashed;
        self.write_index(&items).await?;

        tracing::info!(vault = %self.path, uuid = %file.uuid, trashed, "item trash state changed");
        Ok(items[pos].clone())
    }

    async fn read_item_file(&self, uuid: &str) -> Result<ItemFile, VaultError> {
        check_uuid(uuid)?;
        let bytes = self
            .storage
            .read(&self.item_path(uuid))
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    VaultError::NotFound(format!("item {uuid}"))
                } else {
                    e.into()
                }
            })?;
        Ok(ItemFile::from_bytes(&bytes)?)
    }

    /// Key id that encrypts `file`. Files without one use the session key
    /// for their security level.
    fn key_id_for(&self, file: &ItemFile) -> Result<String, VaultError> {
        match &file.key_id {
            Some(id) if !id.is_empty() => Ok(id.clone()),
            _ => self.session_key(file.security_level),
        }
    }

    async fn decrypt_file(&self, file: &ItemFile) -> Result<ItemContent, VaultError> {
        let key_id = self.key_id_for(file)?;
        let (ciphertext, params) = file.payload()?;
        let plaintext = self.agent.decrypt(&key_id, &ciphertext, &params).await?;
        Ok(ItemContent::from_json(plaintext.expose())?)
    }

    async fn seal_content(
        &self,
        key_id: &str,
        content: &ItemContent,
    ) -> Result<SaltedBlob, VaultError> {
        let params = CryptoParams::for_item();
        let json = content.to_json()?;
        let ciphertext = self.agent.encrypt(key_id, &json, &params).await?;
        Ok(SaltedBlob {
            salt: params.salt,
            ciphertext,
        })
    }
}

/// Item uuids name files in the data directory, so only ASCII letters and
/// digits are accepted.
fn check_uuid(uuid: &str) -> Result<(), VaultError> {
    if !uuid.is_empty() && uuid.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(VaultError::InvalidArgument(format!(
            "item uuid {uuid:?} must be alphanumeric"
        )))
    }
}

fn index_position(items: &[ItemMetadata], uuid: &str) -> Result<usize, VaultError> {
    items
        .iter()
        .position(|item| item.uuid.eq_ignore_ascii_case(uuid))
        .ok_or_else(|| VaultError::NotFound(format!("item {uuid}")))
}
