//! Profile table and per-device service set
//!
//! A profile is a separately registered capability: it matches remote
//! service UUIDs and says whether it participates in auto-connect. A
//! service is a profile attached to one device, with its own connect
//! lifecycle. The service set keeps services ordered by descending profile
//! priority and owns the pending-connect queue driving sequential connects.

use heapless::Vec;

use crate::{
    DeviceError,
    constants::{MAX_PROFILES, MAX_SERVICES, MAX_UUIDS},
    uuid::ServiceUuid,
};

/// Index of a profile in the [`ProfileTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct ProfileId(pub usize);

/// A registered profile capability
#[derive(Debug, Clone)]
pub struct Profile {
    /// Remote service UUID this profile drives
    pub uuid: ServiceUuid,
    /// Short profile name for logs
    pub name: &'static str,
    /// Connect ordering, higher connects first
    pub priority: i8,
    /// Whether plain connect() should include this profile
    pub auto_connect: bool,
    /// Whether the profile is provided by an external handler
    pub external: bool,
    /// Whether this profile lets the device wake the host from suspend
    pub wake_support: bool,
}

/// The registered profile capability table
#[derive(Debug, Default)]
pub struct ProfileTable {
    profiles: Vec<Profile, MAX_PROFILES>,
}

impl ProfileTable {
    /// Create an empty table
    #[must_use]
    pub const fn new() -> Self {
        Self {
            profiles: Vec::new(),
        }
    }

    /// Register a profile
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::NotSupported`] when the table is full.
    pub fn register(&mut self, profile: Profile) -> Result<ProfileId, DeviceError> {
        let id = ProfileId(self.profiles.len());
        self.profiles
            .push(profile)
            .map_err(|_| DeviceError::NotSupported)?;
        Ok(id)
    }

    /// Look up a profile by id
    #[must_use]
    pub fn get(&self, id: ProfileId) -> Option<&Profile> {
        self.profiles.get(id.0)
    }

    /// Find the profile handling a remote service UUID
    #[must_use]
    pub fn find_by_uuid(&self, uuid: ServiceUuid) -> Option<ProfileId> {
        self.profiles
            .iter()
            .position(|p| p.uuid == uuid)
            .map(ProfileId)
    }

    /// Number of registered profiles
    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Connect lifecycle of one service
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ServiceState {
    /// Not connected
    Disconnected,
    /// Connect issued, waiting for the profile
    Connecting,
    /// Profile-level connection established
    Connected,
    /// Disconnect issued, waiting for the profile
    Disconnecting,
}

/// One profile attached to one device
#[derive(Debug, Clone, Copy)]
pub struct Service {
    /// The profile this service instantiates
    pub profile: ProfileId,
    /// Remote service UUID, denormalized for lookups
    pub uuid: ServiceUuid,
    /// Current connect state
    pub state: ServiceState,
    /// Whether the adapter allow-list permits this service
    pub allowed: bool,
}

/// Ordered collection of services attached to one device
#[derive(Debug, Default)]
pub struct ServiceSet {
    services: Vec<Service, MAX_SERVICES>,
    /// Services queued for sequential connect, front first
    pending: Vec<usize, MAX_SERVICES>,
}

impl ServiceSet {
    /// Create an empty set
    #[must_use]
    pub const fn new() -> Self {
        Self {
            services: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Attach a probed profile, keeping descending priority order
    ///
    /// Attaching the same UUID twice is a no-op.
    pub fn attach(&mut self, table: &ProfileTable, id: ProfileId) -> Option<usize> {
        let profile = table.get(id)?;
        if self.find_by_uuid(profile.uuid).is_some() {
            return None;
        }

        let service = Service {
            profile: id,
            uuid: profile.uuid,
            state: ServiceState::Disconnected,
            allowed: true,
        };
        let pos = self
            .services
            .iter()
            .position(|s| {
                table
                    .get(s.profile)
                    .is_some_and(|p| p.priority < profile.priority)
            })
            .unwrap_or(self.services.len());
        self.services.insert(pos, service).ok()?;

        // Indices shift for everything queued at or after the insert point
        for idx in &mut self.pending {
            if *idx >= pos {
                *idx += 1;
            }
        }
        Some(pos)
    }

    /// Detach every service, e.g. when the device is blocked or removed
    pub fn clear(&mut self) {
        self.services.clear();
        self.pending.clear();
    }

    /// All services, highest priority first
    #[must_use]
    pub fn iter(&self) -> core::slice::Iter<'_, Service> {
        self.services.iter()
    }

    /// Number of attached services
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether no services are attached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Find a service by remote UUID
    #[must_use]
    pub fn find_by_uuid(&self, uuid: ServiceUuid) -> Option<usize> {
        self.services.iter().position(|s| s.uuid == uuid)
    }

    /// Whether any service is in the given state
    #[must_use]
    pub fn any_in_state(&self, state: ServiceState) -> bool {
        self.services.iter().any(|s| s.state == state)
    }

    /// Whether any service is connecting or connected
    #[must_use]
    pub fn any_busy(&self) -> bool {
        self.any_in_state(ServiceState::Connecting) || self.any_in_state(ServiceState::Connected)
    }

    /// Update the per-service allow flag from the adapter UUID allow-list
    pub fn update_allowed(&mut self, is_uuid_allowed: impl Fn(ServiceUuid) -> bool) {
        for service in &mut self.services {
            service.allowed = is_uuid_allowed(service.uuid);
        }
    }

    /// Record a profile-driven state change
    pub fn set_state(&mut self, index: usize, state: ServiceState) {
        if let Some(service) = self.services.get_mut(index) {
            service.state = state;
        }
    }

    /// Get a service by index
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Service> {
        self.services.get(index)
    }

    /// Build the pending-connect queue
    ///
    /// With a UUID: exactly that service, if connectable and allowed. Without
    /// one: every allowed auto-connect profile that is currently
    /// disconnected, in priority order.
    ///
    /// # Errors
    ///
    /// [`DeviceError::DoesNotExist`] when the requested UUID has no service,
    /// [`DeviceError::ProfileUnavailable`] when nothing is eligible.
    pub fn build_pending(
        &mut self,
        table: &ProfileTable,
        uuid: Option<ServiceUuid>,
    ) -> Result<(), DeviceError> {
        if let Some(uuid) = uuid {
            let index = self.find_by_uuid(uuid).ok_or(DeviceError::DoesNotExist)?;
            let service = &self.services[index];
            if !service.allowed {
                defmt::info!("service {} is blocked", service.uuid.as_u16());
                return Err(DeviceError::ProfileUnavailable);
            }
            if !self.pending.contains(&index) {
                self.pending.push(index).ok();
            }
            return Ok(());
        }

        for (index, service) in self.services.iter().enumerate() {
            let Some(profile) = table.get(service.profile) else {
                continue;
            };
            if !profile.auto_connect {
                continue;
            }
            if !service.allowed {
                defmt::info!("service {} is blocked", service.uuid.as_u16());
                continue;
            }
            if service.state != ServiceState::Disconnected {
                continue;
            }
            if !self.pending.contains(&index) {
                self.pending.push(index).ok();
            }
        }

        if self.pending.is_empty() {
            return Err(DeviceError::ProfileUnavailable);
        }
        Ok(())
    }

    /// Pop the next pending service and mark it connecting
    ///
    /// Returns the service index, or `None` when the queue is drained.
    pub fn start_next_pending(&mut self) -> Option<usize> {
        while !self.pending.is_empty() {
            let index = self.pending.remove(0);
            if let Some(service) = self.services.get_mut(index) {
                if service.state == ServiceState::Disconnected {
                    service.state = ServiceState::Connecting;
                    return Some(index);
                }
            }
        }
        None
    }

    /// Drop the pending queue without touching service states
    pub fn drop_pending(&mut self) {
        self.pending.clear();
    }

    /// Whether connects are still queued
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The resolved UUIDs of every attached service
    #[must_use]
    pub fn uuids(&self) -> Vec<ServiceUuid, MAX_UUIDS> {
        self.services.iter().map(|s| s.uuid).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::{UUID_AUDIO_SINK, UUID_AUDIO_SOURCE, UUID_HID};

    fn table() -> ProfileTable {
        let mut t = ProfileTable::new();
        t.register(Profile {
            uuid: UUID_AUDIO_SINK,
            name: "a2dp-sink",
            priority: 10,
            auto_connect: true,
            external: false,
            wake_support: false,
        })
        .unwrap();
        t.register(Profile {
            uuid: UUID_HID,
            name: "hid",
            priority: 20,
            auto_connect: true,
            external: false,
            wake_support: true,
        })
        .unwrap();
        t.register(Profile {
            uuid: UUID_AUDIO_SOURCE,
            name: "a2dp-source",
            priority: 5,
            auto_connect: false,
            external: false,
            wake_support: false,
        })
        .unwrap();
        t
    }

    #[test]
    fn test_profile_lookup() {
        let t = table();
        assert_eq!(t.find_by_uuid(UUID_HID), Some(ProfileId(1)));
        assert_eq!(t.find_by_uuid(ServiceUuid::from_u16(0x1108)), None);
    }

    #[test]
    fn test_attach_keeps_priority_order() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(0)).unwrap(); // prio 10
        set.attach(&t, ProfileId(2)).unwrap(); // prio 5
        set.attach(&t, ProfileId(1)).unwrap(); // prio 20

        let uuids: Vec<ServiceUuid, 8> = set.iter().map(|s| s.uuid).collect();
        assert_eq!(
            uuids.as_slice(),
            &[UUID_HID, UUID_AUDIO_SINK, UUID_AUDIO_SOURCE]
        );
    }

    #[test]
    fn test_attach_same_uuid_once() {
        let t = table();
        let mut set = ServiceSet::new();
        assert!(set.attach(&t, ProfileId(0)).is_some());
        assert!(set.attach(&t, ProfileId(0)).is_none());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_pending_auto_connect_order() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(0)).unwrap();
        set.attach(&t, ProfileId(1)).unwrap();
        set.attach(&t, ProfileId(2)).unwrap();

        set.build_pending(&t, None).unwrap();

        // HID (prio 20) first, sink (prio 10) second, source not auto-connect
        let first = set.start_next_pending().unwrap();
        assert_eq!(set.get(first).unwrap().uuid, UUID_HID);
        assert_eq!(set.get(first).unwrap().state, ServiceState::Connecting);

        let second = set.start_next_pending().unwrap();
        assert_eq!(set.get(second).unwrap().uuid, UUID_AUDIO_SINK);

        assert!(set.start_next_pending().is_none());
    }

    #[test]
    fn test_pending_single_uuid() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(0)).unwrap();
        set.attach(&t, ProfileId(2)).unwrap();

        // The non-auto-connect source profile can still be targeted directly
        set.build_pending(&t, Some(UUID_AUDIO_SOURCE)).unwrap();
        let idx = set.start_next_pending().unwrap();
        assert_eq!(set.get(idx).unwrap().uuid, UUID_AUDIO_SOURCE);
    }

    #[test]
    fn test_pending_unknown_uuid() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(0)).unwrap();

        assert_eq!(
            set.build_pending(&t, Some(UUID_HID)),
            Err(DeviceError::DoesNotExist)
        );
    }

    #[test]
    fn test_pending_empty_is_profile_unavailable() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(2)).unwrap(); // not auto-connect

        assert_eq!(
            set.build_pending(&t, None),
            Err(DeviceError::ProfileUnavailable)
        );
    }

    #[test]
    fn test_blocked_service_is_skipped() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(0)).unwrap();
        set.attach(&t, ProfileId(1)).unwrap();

        // Allow-list rejects HID
        set.update_allowed(|uuid| uuid != UUID_HID);

        set.build_pending(&t, None).unwrap();
        let idx = set.start_next_pending().unwrap();
        assert_eq!(set.get(idx).unwrap().uuid, UUID_AUDIO_SINK);
        assert!(set.start_next_pending().is_none());

        // A blocked service targeted directly fails outright
        set.drop_pending();
        assert_eq!(
            set.build_pending(&t, Some(UUID_HID)),
            Err(DeviceError::ProfileUnavailable)
        );
    }

    #[test]
    fn test_busy_tracking() {
        let t = table();
        let mut set = ServiceSet::new();
        let idx = set.attach(&t, ProfileId(0)).unwrap();
        assert!(!set.any_busy());

        set.set_state(idx, ServiceState::Connecting);
        assert!(set.any_busy());

        set.set_state(idx, ServiceState::Connected);
        assert!(set.any_busy());

        set.set_state(idx, ServiceState::Disconnected);
        assert!(!set.any_busy());
    }

    #[test]
    fn test_pending_indices_survive_priority_insert() {
        let t = table();
        let mut set = ServiceSet::new();
        set.attach(&t, ProfileId(0)).unwrap(); // sink at 0
        set.build_pending(&t, Some(UUID_AUDIO_SINK)).unwrap();

        // HID inserts in front of sink, shifting its index
        set.attach(&t, ProfileId(1)).unwrap();

        let idx = set.start_next_pending().unwrap();
        assert_eq!(set.get(idx).unwrap().uuid, UUID_AUDIO_SINK);
    }
}
