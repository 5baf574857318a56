//! Persisted device records
//!
//! The logical persistence layout: one info record per promoted device
//! (identity, technologies, policy, keys, services) and one cache record
//! holding state that is worth keeping even for devices that were never
//! promoted (the observed name, discovery results). Records carry serde
//! derives; the byte format belongs to the storage backend.
//!
//! The registry never writes eagerly: mutations mark the device dirty and
//! the next tick emits a single store command, which the backend answers
//! by pulling the records built here.

use embassy_time::Instant;
use heapless::{String, Vec};

use crate::{
    AddressType, BearerType, Device, PreferredBearer,
    browse::GattPrimary,
    cache::DeviceId,
    constants::{MAX_NAME_LENGTH, MAX_PRIMARIES, MAX_SIRKS, MAX_UUIDS},
    keys::{CsrkInfo, LtkInfo},
    service::ProfileTable,
    uuid::ServiceUuid,
};

/// Persisted form of one set identity resolving key
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SirkRecord {
    /// Raw key bytes
    pub key: [u8; 16],
    /// Whether the key is LTK-encrypted
    pub encrypted: bool,
    /// Coordinated set size
    pub size: u8,
    /// Device rank in the set
    pub rank: u8,
}

/// Persisted per-bearer pairing state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BearerRecord {
    /// Bearer is known for this device
    pub present: bool,
    /// Keys are stored for this bearer
    pub bonded: bool,
}

/// The persisted info record of a promoted device
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceInfoRecord {
    // [General]
    /// Remote device name
    pub name: String<MAX_NAME_LENGTH>,
    /// Locally assigned alias
    pub alias: Option<String<MAX_NAME_LENGTH>>,
    /// Class of device
    pub class: Option<u32>,
    /// LE appearance
    pub appearance: Option<u16>,
    /// Supported technologies
    pub bredr: BearerRecord,
    /// Supported technologies
    pub le: BearerRecord,
    /// Identity address type
    pub address_type: AddressType,
    /// Preferred bearer policy
    pub prefer_bearer: PreferredBearer,
    /// Bearer used by the most recent connection
    pub last_used_bearer: Option<BearerType>,
    /// Trusted flag
    pub trusted: bool,
    /// Blocked flag
    pub blocked: bool,
    /// Device was paired out-of-band over a cable
    pub cable_pairing: bool,
    /// Remote wakeup granted
    pub wake_allowed: bool,
    /// Resolved service UUIDs
    pub services: Vec<ServiceUuid, MAX_UUIDS>,

    // [DeviceID]
    /// Vendor/product quad
    pub device_id: Option<DeviceId>,

    // [LongTermKey] / [LocalSignatureKey] / [RemoteSignatureKey]
    /// Long-term key
    pub ltk: Option<LtkInfo>,
    /// Local signature key
    pub local_csrk: Option<CsrkInfo>,
    /// Remote signature key
    pub remote_csrk: Option<CsrkInfo>,

    // [SetIdentityResolvingKey#N]
    /// Set identity resolving keys
    pub sirks: Vec<SirkRecord, MAX_SIRKS>,

    // [ServiceChanged]
    /// Service-changed CCC for the LE bearer
    pub ccc_le: u16,
    /// Service-changed CCC for the BR/EDR bearer
    pub ccc_bredr: u16,
}

impl DeviceInfoRecord {
    /// Snapshot a device into its persisted form
    #[must_use]
    pub fn from_device(device: &Device) -> Self {
        let bredr_state = device.bearer_state(BearerType::BrEdr);
        let le_state = device.bearer_state(BearerType::Le);

        let last_used_bearer = match (bredr_state.last_used, le_state.last_used) {
            (Some(b), Some(l)) => Some(if l >= b {
                BearerType::Le
            } else {
                BearerType::BrEdr
            }),
            (Some(_), None) => Some(BearerType::BrEdr),
            (None, Some(_)) => Some(BearerType::Le),
            (None, None) => None,
        };

        let (ccc_le, ccc_bredr) = device.svc_chng_ccc();

        Self {
            name: device.cache.name.clone(),
            alias: device.cache.alias.clone(),
            class: device.cache.class.map(|c| c.raw()),
            appearance: device.cache.appearance,
            bredr: BearerRecord {
                present: device.has_bredr(),
                bonded: bredr_state.bonded,
            },
            le: BearerRecord {
                present: device.has_le(),
                bonded: le_state.bonded,
            },
            address_type: device.address_type(),
            prefer_bearer: device.preferred_bearer(),
            last_used_bearer,
            trusted: device.is_trusted(),
            blocked: device.is_blocked(),
            cable_pairing: device.is_cable_pairing(),
            wake_allowed: device.wake_allowed(),
            services: device.uuids().iter().copied().collect(),
            device_id: device.cache.device_id,
            ltk: device.keys.ltk,
            local_csrk: device.keys.local_csrk,
            remote_csrk: device.keys.remote_csrk,
            sirks: device
                .keys
                .sirks
                .iter()
                .map(|s| SirkRecord {
                    key: s.key,
                    encrypted: s.encrypted,
                    size: s.size,
                    rank: s.rank,
                })
                .collect(),
            ccc_le,
            ccc_bredr,
        }
    }

    /// Rebuild device state from a loaded record
    ///
    /// The device comes out promoted (not temporary) since only promoted
    /// devices are ever stored.
    pub fn apply(&self, device: &mut Device, profiles: &ProfileTable, out: &mut crate::Outbox) {
        device.cache.set_name(self.name.as_str());
        if let Some(alias) = &self.alias {
            device.cache.set_alias(alias.as_str());
        }
        if let Some(class) = self.class {
            device.cache.set_class(class);
        }
        if let Some(appearance) = self.appearance {
            device.cache.set_appearance(appearance);
        }
        device.cache.device_id = self.device_id;

        device.restore_bearers(self.bredr.present, self.le.present);
        device.restore_policy(self.trusted, self.blocked, self.cable_pairing, self.wake_allowed);
        device.restore_preferred_bearer(self.prefer_bearer);

        for (bearer, record) in [
            (BearerType::BrEdr, &self.bredr),
            (BearerType::Le, &self.le),
        ] {
            if record.bonded {
                device.set_bonded(bearer, out);
            }
        }

        if self.prefer_bearer == PreferredBearer::LastUsed {
            if let Some(bearer) = self.last_used_bearer {
                let mut state = *device.bearer_state(bearer);
                state.prefer = true;
                device.restore_bearer_state(bearer, state);
            }
        }

        device.keys.ltk = self.ltk;
        device.keys.local_csrk = self.local_csrk;
        device.keys.remote_csrk = self.remote_csrk;
        for sirk in &self.sirks {
            device.keys.add_sirk(sirk.key, sirk.encrypted, sirk.size, sirk.rank);
        }

        device.restore_services(&self.services, &[], profiles);
        device.restore_svc_chng_ccc(self.ccc_le, self.ccc_bredr);
    }
}

/// The cache record: observed state kept even without promotion
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceCacheRecord {
    /// Observed remote name
    pub name: String<MAX_NAME_LENGTH>,
    /// Seconds-since-boot of the last failed name resolution
    pub name_resolve_failed_secs: Option<u64>,
    /// Service UUIDs from SDP records
    pub uuids: Vec<ServiceUuid, MAX_UUIDS>,
    /// Primary GATT services (attribute ranges)
    pub primaries: Vec<GattPrimary, MAX_PRIMARIES>,
}

impl DeviceCacheRecord {
    /// Snapshot the cacheable part of a device
    #[must_use]
    pub fn from_device(device: &Device) -> Self {
        Self {
            name: device.cache.name.clone(),
            name_resolve_failed_secs: device.name_resolve_failed_at().map(|i| i.as_secs()),
            uuids: device.uuids().iter().copied().collect(),
            primaries: device.primaries().iter().copied().collect(),
        }
    }

    /// Rebuild cached state on a freshly created device
    pub fn apply(&self, device: &mut Device, profiles: &ProfileTable) {
        device.cache.set_name(self.name.as_str());
        device.restore_name_resolve_failed(
            self.name_resolve_failed_secs.map(Instant::from_secs),
        );
        device.restore_services(&self.uuids, &self.primaries, profiles);
    }
}

/// Whether the info record must exist on stable storage for this device
#[must_use]
pub fn should_store(device: &Device) -> bool {
    device.is_storable()
}

/// Convenience used by backends: both records at once
#[must_use]
pub fn snapshot(device: &Device) -> (Option<DeviceInfoRecord>, DeviceCacheRecord) {
    let info = if should_store(device) {
        Some(DeviceInfoRecord::from_device(device))
    } else {
        None
    };
    (info, DeviceCacheRecord::from_device(device))
}
