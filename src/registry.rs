//! Light registry
//!
//! A flat, fixed-capacity table of the lights the client has registered, keyed by unicast
//! address. The registry is a pure data holder: connection transitions and effect lifecycle
//! are decided elsewhere and only recorded here. Capacity is [`MAX_LIGHTS`](crate::MAX_LIGHTS)
//! and lookups are linear, which at nine entries beats any map.

use core::fmt;

use crate::{UnicastAddress, MAX_LIGHTS};

/// Longest client-assigned identifier accepted, in bytes
pub const MAX_ID_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Every slot is occupied
    Full,
    /// The client-assigned identifier exceeds [`MAX_ID_LEN`] bytes
    IdTooLong(usize),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RegistryError::Full => write!(f, "Light registry is full ({} entries)", MAX_LIGHTS),
            RegistryError::IdTooLong(len) => {
                write!(f, "Light id of {} bytes exceeds the {} byte limit", len, MAX_ID_LEN)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// One registered light
#[derive(Debug, Clone)]
pub struct Light {
    /// Opaque client-assigned identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Mesh unicast address, the registry key
    pub unicast: UnicastAddress,
    /// Reachable through the currently open proxy session
    pub connected: bool,
    /// Pool slot of the software effect running on this light, if any
    ///
    /// This is a weak reference for display and lifecycle queries only; the scheduler owns
    /// the instance and is the only writer besides the clearing done on unlink.
    pub effect_slot: Option<usize>,
}

/// The fixed table of registered lights
#[derive(Debug, Default)]
pub struct LightRegistry {
    slots: [Option<Light>; MAX_LIGHTS],
}

impl LightRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Add a light, or update the entry already registered under the same unicast
    ///
    /// Idempotent: repeated adds leave exactly one entry whose fields equal the last write.
    /// The `connected` flag and effect back-pointer of an existing entry are preserved.
    pub fn add(&mut self, id: &str, unicast: UnicastAddress, name: &str) -> Result<(), RegistryError> {
        if id.len() > MAX_ID_LEN {
            return Err(RegistryError::IdTooLong(id.len()));
        }

        if let Some(light) = self.get_mut(unicast) {
            light.id = id.to_string();
            light.name = name.to_string();

            return Ok(());
        }

        let free = self
            .slots
            .iter()
            .position(|slot| slot.is_none())
            .ok_or(RegistryError::Full)?;

        self.slots[free] = Some(Light {
            id: id.to_string(),
            name: name.to_string(),
            unicast,
            connected: false,
            effect_slot: None,
        });

        Ok(())
    }

    fn index_of(&self, unicast: UnicastAddress) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |light| light.unicast == unicast))
    }

    pub fn get(&self, unicast: UnicastAddress) -> Option<&Light> {
        self.index_of(unicast).and_then(move |i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, unicast: UnicastAddress) -> Option<&mut Light> {
        self.index_of(unicast).and_then(move |i| self.slots[i].as_mut())
    }

    /// Clear the slot registered under `unicast`
    pub fn remove(&mut self, unicast: UnicastAddress) -> Option<Light> {
        self.index_of(unicast).and_then(|i| self.slots[i].take())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Light> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Light> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flip the connected flag on every registered light
    ///
    /// Returns the unicasts whose flag actually changed, so the caller can publish exactly
    /// one status event per transition.
    pub fn set_all_connected(&mut self, connected: bool) -> Vec<UnicastAddress> {
        self.iter_mut()
            .filter(|light| light.connected != connected)
            .map(|light| {
                light.connected = connected;
                light.unicast
            })
            .collect()
    }
}
