use uuid::Uuid;

use crate::types::{DeviceId, DeviceIdentity};

impl DeviceIdentity {
    /// Generate a fresh identity with a short random id.
    ///
    /// Without an explicit name the device is called `User-xxxx`, using the
    /// first four characters of the id.
    pub fn generate(name: Option<String>, address: impl Into<String>) -> Self {
        let id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("User-{}", &id[..4]));

        Self {
            id: DeviceId(id),
            name,
            address: address.into(),
        }
    }

    /// Apply a new display name. Blank names are ignored.
    ///
    /// Returns `true` when the name changed.
    pub fn rename(&mut self, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() || name == self.name {
            return false;
        }
        self.name = name.to_string();
        true
    }
}
