//! Key-value settings owned by the host, and the slot map kept in them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::{Result, ScaleError};

/// One edit in an atomic settings batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingChange {
    /// Store a value
    Set(String, String),
    /// Delete a key
    Remove(String),
}

/// Host-provided persistent string store.
///
/// Shared by every session, so implementations must serialize writers.
pub trait SettingsStore: Send + Sync {
    /// Read a value
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the backing store fails.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Apply all changes or none
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the backing store fails.
    fn apply(&self, changes: Vec<SettingChange>) -> Result<()>;
}

/// In-memory store, handy for tests and short-lived tools
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettings {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    fn apply(&self, changes: Vec<SettingChange>) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        for change in changes {
            match change {
                SettingChange::Set(key, value) => {
                    values.insert(key, value);
                }
                SettingChange::Remove(key) => {
                    values.remove(&key);
                }
            }
        }
        Ok(())
    }
}

/// Device-scoped view of the settings store holding the slot map and
/// pairing secrets of one scale.
///
/// The slot entry is authoritative: a slot key holds exactly one local
/// profile id, and a user's reverse entry only counts while the slot
/// still points back at that user.
#[derive(Clone)]
pub struct RemoteUsers {
    store: Arc<dyn SettingsStore>,
    device: String,
}

impl std::fmt::Debug for RemoteUsers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteUsers")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ScaleError::Settings(format!("{key} holds non-numeric value {value:?}")))
}

impl RemoteUsers {
    /// View for one device, usually keyed by [`DeviceInfo::settings_key`]
    ///
    /// [`DeviceInfo::settings_key`]: crate::types::DeviceInfo::settings_key
    #[must_use]
    pub fn new(store: Arc<dyn SettingsStore>, device: impl Into<String>) -> Self {
        Self {
            store,
            device: device.into(),
        }
    }

    fn slot_key(&self, slot: u64) -> String {
        format!("{}/slot/{slot}", self.device)
    }

    fn user_key(&self, user_id: u32) -> String {
        format!("{}/user/{user_id}", self.device)
    }

    fn secret_key(&self, name: &str) -> String {
        format!("{}/secret/{name}", self.device)
    }

    fn user_secret_key(&self, user_id: u32, name: &str) -> String {
        format!("{}/user/{user_id}/{name}", self.device)
    }

    /// Local profile bound to a device slot
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails or holds garbage.
    pub fn user_for(&self, slot: u64) -> Result<Option<u32>> {
        let key = self.slot_key(slot);
        self.store
            .get(&key)?
            .map(|value| parse_number(&key, &value))
            .transpose()
    }

    /// Device slot bound to a local profile
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails or holds garbage.
    pub fn slot_for(&self, user_id: u32) -> Result<Option<u64>> {
        let key = self.user_key(user_id);
        let Some(value) = self.store.get(&key)? else {
            return Ok(None);
        };
        let slot = parse_number(&key, &value)?;

        if self.user_for(slot)? == Some(user_id) {
            Ok(Some(slot))
        } else {
            debug!("Ignoring stale slot {} for user {}", slot, user_id);
            Ok(None)
        }
    }

    /// Bind a slot to a profile, replacing whatever either side was bound to
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails.
    pub fn bind(&self, user_id: u32, slot: u64) -> Result<()> {
        let mut changes = Vec::new();

        if let Some(previous_user) = self.user_for(slot)? {
            if previous_user != user_id {
                changes.push(SettingChange::Remove(self.user_key(previous_user)));
            }
        }
        if let Some(previous_slot) = self.slot_for(user_id)? {
            if previous_slot != slot {
                changes.push(SettingChange::Remove(self.slot_key(previous_slot)));
            }
        }
        changes.push(SettingChange::Set(self.slot_key(slot), user_id.to_string()));
        changes.push(SettingChange::Set(self.user_key(user_id), slot.to_string()));

        self.store.apply(changes)?;
        info!("Bound slot {} on {} to user {}", slot, self.device, user_id);
        Ok(())
    }

    /// Drop a profile's slot binding
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails.
    pub fn unbind(&self, user_id: u32) -> Result<()> {
        let mut changes = vec![SettingChange::Remove(self.user_key(user_id))];
        if let Some(slot) = self.slot_for(user_id)? {
            changes.push(SettingChange::Remove(self.slot_key(slot)));
        }
        self.store.apply(changes)
    }

    fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store
            .get(key)?
            .map(|value| {
                hex::decode(&value)
                    .map_err(|e| ScaleError::Settings(format!("{key} is not valid hex: {e}")))
            })
            .transpose()
    }

    /// Device-wide secret, e.g. a pairing password
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails or holds garbage.
    pub fn secret(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.get_bytes(&self.secret_key(name))
    }

    /// Store a device-wide secret
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails.
    pub fn set_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        self.store.apply(vec![SettingChange::Set(
            self.secret_key(name),
            hex::encode(value),
        )])
    }

    /// Per-profile secret, e.g. a consent or authentication code
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails or holds garbage.
    pub fn user_secret(&self, user_id: u32, name: &str) -> Result<Option<Vec<u8>>> {
        self.get_bytes(&self.user_secret_key(user_id, name))
    }

    /// Store a per-profile secret
    ///
    /// # Errors
    ///
    /// [`ScaleError::Settings`] if the store fails.
    pub fn set_user_secret(&self, user_id: u32, name: &str, value: &[u8]) -> Result<()> {
        self.store.apply(vec![SettingChange::Set(
            self.user_secret_key(user_id, name),
            hex::encode(value),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_users() -> (Arc<MemorySettings>, RemoteUsers) {
        let store = Arc::new(MemorySettings::new());
        let users = RemoteUsers::new(store.clone(), "AABBCCDDEEFF");
        (store, users)
    }

    #[test]
    fn test_bind_and_lookup() {
        let (_, users) = remote_users();
        assert_eq!(users.slot_for(1).unwrap(), None);

        users.bind(1, 1001).unwrap();
        assert_eq!(users.slot_for(1).unwrap(), Some(1001));
        assert_eq!(users.user_for(1001).unwrap(), Some(1));
    }

    #[test]
    fn test_one_profile_per_slot() {
        let (_, users) = remote_users();
        users.bind(1, 3).unwrap();
        users.bind(2, 3).unwrap();

        assert_eq!(users.user_for(3).unwrap(), Some(2));
        assert_eq!(users.slot_for(1).unwrap(), None);
        assert_eq!(users.slot_for(2).unwrap(), Some(3));
    }

    #[test]
    fn test_rebinding_frees_old_slot() {
        let (_, users) = remote_users();
        users.bind(1, 3).unwrap();
        users.bind(1, 4).unwrap();

        assert_eq!(users.user_for(3).unwrap(), None);
        assert_eq!(users.slot_for(1).unwrap(), Some(4));

        users.unbind(1).unwrap();
        assert_eq!(users.user_for(4).unwrap(), None);
    }

    #[test]
    fn test_secrets_are_hex_encoded() {
        let (store, users) = remote_users();
        users.set_secret("password", &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        users.set_user_secret(7, "consent", &[0x12, 0x34]).unwrap();

        assert_eq!(
            store.get("AABBCCDDEEFF/secret/password").unwrap(),
            Some("deadbeef".to_string())
        );
        assert_eq!(
            users.secret("password").unwrap(),
            Some(vec![0xDE, 0xAD, 0xBE, 0xEF])
        );
        assert_eq!(users.user_secret(7, "consent").unwrap(), Some(vec![0x12, 0x34]));
        assert_eq!(users.user_secret(8, "consent").unwrap(), None);
    }

    #[test]
    fn test_garbage_is_reported() {
        let (store, users) = remote_users();
        store
            .apply(vec![SettingChange::Set(
                "AABBCCDDEEFF/slot/1".to_string(),
                "abc".to_string(),
            )])
            .unwrap();
        assert!(matches!(users.user_for(1), Err(ScaleError::Settings(_))));
    }
}
