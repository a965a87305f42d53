use crate::error::Error;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[cfg(test)]
#[path = "address_test.rs"]
mod tests;

/// A destination within the messaging service: a user plus an optional device.
///
/// String form is `"UUID.device_id"`; a bare `"UUID"` addresses all of that user's
/// devices. Device ids are small positive integers; `1` is the primary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Address {
    pub user_id: Uuid,
    pub device_id: Option<u32>,
}

impl Address {
    pub fn new(user_id: Uuid, device_id: Option<u32>) -> Self {
        Self { user_id, device_id }
    }

    /// An address for every device of `user_id` (the bare-UUID form).
    pub fn all_devices(user_id: Uuid) -> Self {
        Self { user_id, device_id: None }
    }

    /// This address, pinned to a specific device.
    pub fn with_device(&self, device_id: u32) -> Self {
        Self { user_id: self.user_id, device_id: Some(device_id) }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '.');
        let user_part = parts.next().unwrap_or("");
        let device_part = parts.next();
        if parts.next().is_some() {
            return Err(Error::Protocol(format!("invalid address: more than one '.' in {:?}", s)));
        }

        let user_id = Uuid::parse_str(user_part)
            .map_err(|e| Error::Protocol(format!("invalid address user id {:?}: {}", user_part, e)))?;

        let device_id = match device_part {
            None => None,
            Some(d) => Some(
                d.parse::<u32>()
                    .map_err(|e| Error::Protocol(format!("invalid address device id {:?}: {}", d, e)))?,
            ),
        };

        Ok(Address { user_id, device_id })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_id {
            Some(d) => write!(f, "{}.{}", self.user_id, d),
            None => write!(f, "{}", self.user_id),
        }
    }
}
