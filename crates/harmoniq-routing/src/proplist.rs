use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEVICE_DESCRIPTION: &str = "device.description";
pub const DEVICE_CLASS: &str = "device.class";
pub const DEVICE_MASTER_DEVICE: &str = "device.master_device";
pub const DEVICE_PRIORITY: &str = "device.priority";
pub const MEDIA_NAME: &str = "media.name";
pub const MEDIA_ROLE: &str = "media.role";
pub const APPLICATION_NAME: &str = "application.name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateMode {
    /// Only insert keys that are not present yet.
    Set,
    /// Insert or overwrite keys from the other list.
    Merge,
    /// Drop everything, then take the other list.
    Replace,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Proplist {
    entries: BTreeMap<String, String>,
}

impl Proplist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn update(&mut self, mode: UpdateMode, other: &Proplist) {
        match mode {
            UpdateMode::Set => {
                for (key, value) in &other.entries {
                    self.entries
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
            UpdateMode::Merge => {
                for (key, value) in &other.entries {
                    self.entries.insert(key.clone(), value.clone());
                }
            }
            UpdateMode::Replace => {
                self.entries = other.entries.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_modes() {
        let base = Proplist::new().with(MEDIA_NAME, "a").with(MEDIA_ROLE, "music");
        let other = Proplist::new().with(MEDIA_NAME, "b").with(APPLICATION_NAME, "player");

        let mut set = base.clone();
        set.update(UpdateMode::Set, &other);
        assert_eq!(set.get(MEDIA_NAME), Some("a"));
        assert_eq!(set.get(APPLICATION_NAME), Some("player"));

        let mut merge = base.clone();
        merge.update(UpdateMode::Merge, &other);
        assert_eq!(merge.get(MEDIA_NAME), Some("b"));
        assert_eq!(merge.len(), 3);

        let mut replace = base;
        replace.update(UpdateMode::Replace, &other);
        assert!(!replace.contains(MEDIA_ROLE));
    }
}
