//! Advertising / EIR cache
//!
//! Merges identity data observed from inquiry EIR, LE advertising reports
//! and SDP results. Setters return whether the observable value actually
//! changed so the owner can emit exactly one property change per change.

use heapless::{String, Vec};

use crate::{
    ClassOfDevice,
    class_of_device::icon_from_appearance,
    constants::{
        MAX_DATA_LEN, MAX_DATA_RECORDS, MAX_EIR_UUIDS, MAX_MODALIAS_LENGTH, MAX_NAME_LENGTH,
        RSSI_DELTA_THRESHOLD, TX_POWER_UNKNOWN,
    },
    uuid::ServiceUuid,
};

/// Device-ID quad extracted from the PnP record or DIS service
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceId {
    /// ID source (1 = Bluetooth SIG, 2 = USB-IF)
    pub source: u16,
    /// Vendor identifier
    pub vendor: u16,
    /// Product identifier
    pub product: u16,
    /// Product version
    pub version: u16,
}

impl DeviceId {
    /// Render the modalias string for this quad
    #[must_use]
    pub fn modalias(&self) -> String<MAX_MODALIAS_LENGTH> {
        use core::fmt::Write;

        let mut s = String::new();
        let prefix = match self.source {
            1 => "bluetooth",
            2 => "usb",
            _ => "bluetooth",
        };
        write!(
            s,
            "{prefix}:v{:04X}p{:04X}d{:04X}",
            self.vendor, self.product, self.version
        )
        .ok();
        s
    }
}

/// A keyed data blob from EIR or advertising
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlob<K: PartialEq> {
    /// Record key: company id, service UUID or AD type
    pub key: K,
    /// Record payload
    pub data: Vec<u8, MAX_DATA_LEN>,
}

fn merge_blobs<K: PartialEq + Clone>(
    records: &mut Vec<DataBlob<K>, MAX_DATA_RECORDS>,
    incoming: &[(K, &[u8])],
    replace_all: bool,
) -> bool {
    let mut changed = false;

    if replace_all && !records.is_empty() {
        records.clear();
        changed = true;
    }

    for (key, data) in incoming {
        let mut blob = Vec::new();
        blob.extend_from_slice(&data[..data.len().min(MAX_DATA_LEN)])
            .ok();

        if let Some(existing) = records.iter_mut().find(|r| r.key == *key) {
            if existing.data != blob {
                existing.data = blob;
                changed = true;
            }
        } else if records
            .push(DataBlob {
                key: key.clone(),
                data: blob,
            })
            .is_ok()
        {
            changed = true;
        }
    }

    changed
}

/// Everything learned about a device from scanning and inquiry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingCache {
    /// Remote-provided device name, last non-empty report wins
    pub name: String<MAX_NAME_LENGTH>,
    /// Locally assigned alias
    pub alias: Option<String<MAX_NAME_LENGTH>>,
    /// BR/EDR class of device
    pub class: Option<ClassOfDevice>,
    /// LE appearance, set once
    pub appearance: Option<u16>,
    /// Device-ID quad from the PnP record
    pub device_id: Option<DeviceId>,
    /// Last observed RSSI
    pub rssi: Option<i8>,
    /// Last observed TX power, `None` until reported
    pub tx_power: Option<i8>,
    /// Advertising flags octet
    pub ad_flags: Option<u8>,
    /// UUIDs observed in EIR/advertising, distinct from resolved ones
    pub eir_uuids: Vec<ServiceUuid, MAX_EIR_UUIDS>,
    /// Manufacturer specific data, keyed by company id
    pub manufacturer_data: Vec<DataBlob<u16>, MAX_DATA_RECORDS>,
    /// Service data, keyed by service UUID
    pub service_data: Vec<DataBlob<ServiceUuid>, MAX_DATA_RECORDS>,
    /// Raw advertising data records, keyed by AD type
    pub advertising_data: Vec<DataBlob<u8>, MAX_DATA_RECORDS>,
}

impl AdvertisingCache {
    /// Update the remote name; empty reports never erase a known name
    pub fn set_name(&mut self, name: &str) -> bool {
        if name.is_empty() || self.name.as_str() == name {
            return false;
        }
        self.name.clear();
        for c in name.chars() {
            if self.name.push(c).is_err() {
                break;
            }
        }
        true
    }

    /// The name shown to users: alias when set, else the remote name
    #[must_use]
    pub fn display_name(&self) -> &str {
        match &self.alias {
            Some(alias) if !alias.is_empty() => alias.as_str(),
            _ => self.name.as_str(),
        }
    }

    /// Set the locally assigned alias; an empty alias reverts to the name
    pub fn set_alias(&mut self, alias: &str) -> bool {
        let new = if alias.is_empty() {
            None
        } else {
            let mut s = String::new();
            for c in alias.chars() {
                if s.push(c).is_err() {
                    break;
                }
            }
            Some(s)
        };
        if self.alias == new {
            return false;
        }
        self.alias = new;
        true
    }

    /// Update the class of device
    pub fn set_class(&mut self, class: u32) -> bool {
        let class = ClassOfDevice::from_raw(class);
        if self.class == Some(class) {
            return false;
        }
        self.class = Some(class);
        true
    }

    /// Update the appearance; zero never clears an established value
    pub fn set_appearance(&mut self, appearance: u16) -> bool {
        if appearance == 0 || self.appearance == Some(appearance) {
            return false;
        }
        self.appearance = Some(appearance);
        true
    }

    /// Update RSSI, reporting only meaningful movement
    ///
    /// A change is reported when the delta reaches the threshold or either
    /// side of the comparison is zero/unknown.
    pub fn set_rssi(&mut self, rssi: i8) -> bool {
        let old = self.rssi.unwrap_or(0);
        self.rssi = Some(rssi);

        if rssi == 0 || old == 0 {
            return rssi != old;
        }
        (i16::from(rssi) - i16::from(old)).abs() >= RSSI_DELTA_THRESHOLD
    }

    /// Update TX power; the 127 sentinel means "not observed"
    pub fn set_tx_power(&mut self, tx_power: i8) -> bool {
        if tx_power == TX_POWER_UNKNOWN {
            return false;
        }
        if self.tx_power == Some(tx_power) {
            return false;
        }
        self.tx_power = Some(tx_power);
        true
    }

    /// Update the advertising flags octet
    pub fn set_ad_flags(&mut self, flags: u8) -> bool {
        if self.ad_flags == Some(flags) {
            return false;
        }
        self.ad_flags = Some(flags);
        true
    }

    /// Union EIR-observed UUIDs into the cache
    pub fn add_eir_uuids(&mut self, uuids: &[ServiceUuid]) -> bool {
        let mut changed = false;
        for uuid in uuids {
            if !self.eir_uuids.contains(uuid) && self.eir_uuids.push(*uuid).is_ok() {
                changed = true;
            }
        }
        changed
    }

    /// Drop the EIR UUID set, done when the link goes fully down
    pub fn clear_eir_uuids(&mut self) {
        self.eir_uuids.clear();
    }

    /// Merge manufacturer data records
    pub fn set_manufacturer_data(&mut self, records: &[(u16, &[u8])], replace_all: bool) -> bool {
        merge_blobs(&mut self.manufacturer_data, records, replace_all)
    }

    /// Merge service data records
    pub fn set_service_data(
        &mut self,
        records: &[(ServiceUuid, &[u8])],
        replace_all: bool,
    ) -> bool {
        merge_blobs(&mut self.service_data, records, replace_all)
    }

    /// Merge raw advertising data records
    pub fn set_advertising_data(&mut self, records: &[(u8, &[u8])], replace_all: bool) -> bool {
        merge_blobs(&mut self.advertising_data, records, replace_all)
    }

    /// Derive the icon name, class first with appearance fallback
    #[must_use]
    pub fn icon(&self) -> Option<&'static str> {
        if let Some(class) = &self.class {
            if let Some(icon) = class.icon() {
                return Some(icon);
            }
        }
        self.appearance.and_then(icon_from_appearance)
    }
}
