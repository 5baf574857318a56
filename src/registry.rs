//! Device registry: the concurrency hub
//!
//! One registry per adapter owns every tracked device, the profile table
//! and the policy configuration. Collaborator events, API requests and the
//! periodic tick all funnel through here while the registry is locked, so
//! every observable transition of a device is totally ordered. Side
//! effects leave through the [`Outbox`].

use embassy_time::Instant;
use heapless::{FnvIndexMap, String, Vec};

use crate::{
    AddressType, BearerType, Command, Device, DeviceAddress, DeviceError, DeviceEvent, FoundData,
    Outbox, PreferredBearer, Property, Request, RequestOp, Response,
    config::RegistryConfig,
    constants::{MAX_DEVICES, MAX_MODALIAS_LENGTH, MAX_NAME_LENGTH, MAX_UUIDS},
    keys::CsrkKind,
    service::{Profile, ProfileId, ProfileTable},
    store::{DeviceCacheRecord, DeviceInfoRecord},
    uuid::ServiceUuid,
};

/// Point-in-time readout of a device's observables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Identity address
    pub address: DeviceAddress,
    /// Identity address type
    pub address_type: AddressType,
    /// Remote name
    pub name: String<MAX_NAME_LENGTH>,
    /// Alias, falling back to the name
    pub alias: String<MAX_NAME_LENGTH>,
    /// Class of device
    pub class: Option<u32>,
    /// LE appearance
    pub appearance: Option<u16>,
    /// Derived icon name
    pub icon: Option<&'static str>,
    /// Paired observable
    pub paired: bool,
    /// Bonded observable
    pub bonded: bool,
    /// Trusted flag
    pub trusted: bool,
    /// Blocked flag
    pub blocked: bool,
    /// Connected observable
    pub connected: bool,
    /// ServicesResolved observable
    pub services_resolved: bool,
    /// Observable UUID set
    pub uuids: Vec<ServiceUuid, MAX_UUIDS>,
    /// Signal strength
    pub rssi: Option<i8>,
    /// Advertised TX power
    pub tx_power: Option<i8>,
    /// Modalias when a device id is known
    pub modalias: Option<String<MAX_MODALIAS_LENGTH>>,
    /// Remote wakeup granted
    pub wake_allowed: bool,
    /// Preferred bearer policy
    pub preferred_bearer: PreferredBearer,
}

/// The per-adapter device registry
pub struct DeviceRegistry {
    devices: FnvIndexMap<DeviceAddress, Device, MAX_DEVICES>,
    profiles: ProfileTable,
    config: RegistryConfig,
    powered: bool,
    adapter_bredr: bool,
    allowed_uuids: Option<Vec<ServiceUuid, MAX_UUIDS>>,
    outbox: Outbox,
}

impl DeviceRegistry {
    /// Create a registry with the given policy
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            devices: FnvIndexMap::new(),
            profiles: ProfileTable::new(),
            config,
            powered: true,
            adapter_bredr: true,
            allowed_uuids: None,
            outbox: Outbox::new(),
        }
    }

    /// Register a profile capability
    ///
    /// # Errors
    ///
    /// See [`ProfileTable::register`].
    pub fn register_profile(&mut self, profile: Profile) -> Result<ProfileId, DeviceError> {
        self.profiles.register(profile)
    }

    /// Install the adapter UUID allow-list; `None` allows everything
    pub fn set_uuid_allow_list(&mut self, allowed: Option<&[ServiceUuid]>) {
        self.allowed_uuids = allowed.map(|list| list.iter().copied().collect());
        let allowed = self.allowed_uuids.clone();
        for device in self.devices.values_mut() {
            if device.browse.is_some() {
                // Discovery completion recomputes this anyway
                continue;
            }
            device
                .services
                .update_allowed(|uuid| allowed.as_ref().is_none_or(|l| l.contains(&uuid)));
        }
    }

    /// Whether the local adapter has a BR/EDR side
    pub fn set_adapter_bredr(&mut self, bredr: bool) {
        self.adapter_bredr = bredr;
    }

    fn is_uuid_allowed(allowed: &Option<Vec<ServiceUuid, MAX_UUIDS>>, uuid: ServiceUuid) -> bool {
        allowed.as_ref().is_none_or(|list| list.contains(&uuid))
    }

    /// Number of tracked devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up a device
    #[must_use]
    pub fn device(&self, addr: &DeviceAddress) -> Option<&Device> {
        self.devices.get(addr)
    }

    /// Look up a device mutably
    pub fn device_mut(&mut self, addr: &DeviceAddress) -> Option<&mut Device> {
        self.devices.get_mut(addr)
    }

    /// Create the device if this is its first sighting
    pub fn ensure_device(
        &mut self,
        addr: DeviceAddress,
        addr_type: AddressType,
        now: Instant,
    ) -> Option<&mut Device> {
        if !self.devices.contains_key(&addr) {
            let device = Device::new(addr, addr_type, now, &self.config);
            if self.devices.insert(addr, device).is_err() {
                defmt::warn!("device table full");
                return None;
            }
        }
        self.devices.get_mut(&addr)
    }

    /// Load a stored device during startup
    pub fn insert_stored(
        &mut self,
        addr: DeviceAddress,
        info: &DeviceInfoRecord,
        cache: Option<&DeviceCacheRecord>,
        now: Instant,
    ) {
        let mut device = Device::new(addr, info.address_type, now, &self.config);
        self.outbox.focus(addr);
        info.apply(&mut device, &self.profiles, &mut self.outbox);
        if let Some(cache) = cache {
            cache.apply(&mut device, &self.profiles);
        }
        // Loading is not a mutation worth writing back
        device.take_store_pending();
        self.devices.insert(addr, device).ok();
    }

    /// Drain the side effects accumulated by the last calls
    pub fn drain_outbox(&mut self) -> Outbox {
        core::mem::take(&mut self.outbox)
    }

    /// Read a device snapshot
    #[must_use]
    pub fn snapshot(&self, addr: &DeviceAddress) -> Option<DeviceSnapshot> {
        let device = self.devices.get(addr)?;
        let mut alias = String::new();
        alias.push_str(device.cache.display_name()).ok();

        Some(DeviceSnapshot {
            address: device.address(),
            address_type: device.address_type(),
            name: device.cache.name.clone(),
            alias,
            class: device.cache.class.map(|c| c.raw()),
            appearance: device.cache.appearance,
            icon: device.cache.icon(),
            paired: device.is_paired(),
            bonded: device.is_bonded(),
            trusted: device.is_trusted(),
            blocked: device.is_blocked(),
            connected: device.is_connected(),
            services_resolved: device.services_resolved(),
            uuids: device.observable_uuids(),
            rssi: device.cache.rssi,
            tx_power: device.cache.tx_power,
            modalias: device.cache.device_id.map(|id| id.modalias()),
            wake_allowed: device.wake_allowed(),
            preferred_bearer: device.preferred_bearer(),
        })
    }

    // ---- event dispatch -------------------------------------------------

    /// Apply one collaborator event
    #[allow(clippy::too_many_lines)]
    pub fn handle_event(&mut self, event: DeviceEvent, now: Instant) {
        match event {
            DeviceEvent::Found {
                addr,
                addr_type,
                bearer,
                rssi,
                connectable,
                data,
            } => self.handle_found(addr, addr_type, bearer, rssi, connectable, &data, now),
            DeviceEvent::Connected {
                addr,
                bearer,
                initiator,
            } => {
                self.outbox.focus(addr);
                let (config, outbox) = (&self.config, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.add_connection(bearer, initiator, now, config, outbox);
                }
            }
            DeviceEvent::Disconnected {
                addr,
                bearer,
                reason,
            } => {
                self.outbox.focus(addr);
                let (config, outbox) = (&self.config, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.remove_connection(bearer, reason, now, config, outbox);
                }
            }
            DeviceEvent::BondingComplete {
                addr,
                bearer,
                status,
            } => {
                self.outbox.focus(addr);
                let (config, outbox) = (&self.config, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.bonding_complete(bearer, status, now, config, outbox);
                }
            }
            DeviceEvent::LongTermKey {
                addr,
                key,
                central,
                enc_size,
            } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.set_ltk(key, central, enc_size, &mut self.outbox);
                }
            }
            DeviceEvent::SignatureKey {
                addr,
                kind,
                key,
                counter,
                store_hint,
            } => {
                self.outbox.focus(addr);
                let Some(kind) = CsrkKind::from_raw(kind) else {
                    defmt::warn!("unsupported signature key type {}", kind);
                    return;
                };
                let (config, outbox) = (&self.config, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.set_csrk(kind, key, counter, store_hint, now, config, outbox);
                }
            }
            DeviceEvent::SetIdentityKey {
                addr,
                key,
                encrypted,
                size,
                rank,
            } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.add_sirk(key, encrypted, size, rank, &mut self.outbox);
                }
            }
            DeviceEvent::SignedWrite { addr, counter } => {
                if let Some(device) = self.devices.get_mut(&addr) {
                    if device.signed_write_received(counter).is_err() {
                        defmt::info!("signed write rejected, stale counter {}", counter);
                    }
                }
            }
            DeviceEvent::PinCodeRequested { addr, secure } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    if device.request_pincode(secure, &mut self.outbox).is_err() {
                        defmt::warn!("pin request dropped");
                    }
                }
            }
            DeviceEvent::PasskeyRequested { addr, addr_type } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    if device.request_passkey(addr_type, &mut self.outbox).is_err() {
                        defmt::warn!("passkey request dropped");
                    }
                }
            }
            DeviceEvent::ConfirmRequested {
                addr,
                addr_type,
                passkey,
                confirm_hint,
            } => {
                self.outbox.focus(addr);
                let (config, outbox) = (&self.config, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    if device
                        .confirm_request(addr_type, passkey, confirm_hint, config, outbox)
                        .is_err()
                    {
                        defmt::warn!("confirm request dropped");
                    }
                }
            }
            DeviceEvent::PasskeyNotify {
                addr,
                addr_type,
                passkey,
                entered,
            } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device
                        .notify_passkey(addr_type, passkey, entered, &mut self.outbox)
                        .ok();
                }
            }
            DeviceEvent::PinCodeNotify {
                addr,
                secure,
                pincode,
            } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device
                        .notify_pincode(secure, pincode.as_str(), &mut self.outbox)
                        .ok();
                }
            }
            DeviceEvent::AgentReplied { addr, reply } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.agent_reply(reply, &mut self.outbox);
                }
            }
            DeviceEvent::SdpResult { addr, result } => {
                self.outbox.focus(addr);
                let allowed = self.allowed_uuids.clone();
                let (profiles, outbox) = (&self.profiles, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.sdp_result(
                        result,
                        profiles,
                        |uuid| Self::is_uuid_allowed(&allowed, uuid),
                        outbox,
                    );
                }
            }
            DeviceEvent::GattReady { addr, primaries } => {
                self.outbox.focus(addr);
                let allowed = self.allowed_uuids.clone();
                let (profiles, outbox) = (&self.profiles, &mut self.outbox);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.gatt_ready(
                        &primaries,
                        profiles,
                        |uuid| Self::is_uuid_allowed(&allowed, uuid),
                        outbox,
                    );
                }
            }
            DeviceEvent::GattServicesChanged { addr } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    if device.is_connected() && device.browse.is_none() {
                        device.start_browse_gatt(None, &mut self.outbox);
                    }
                }
            }
            DeviceEvent::ServiceConnected { addr, uuid, result } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.service_connected(uuid, result, &mut self.outbox);
                }
            }
            DeviceEvent::ServiceDisconnected { addr, uuid } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.service_disconnected(uuid, &mut self.outbox);
                }
            }
            DeviceEvent::FlagsChanged {
                addr,
                supported,
                current,
            } => {
                self.outbox.focus(addr);
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.flags_changed(supported, current, &mut self.outbox);
                }
            }
            DeviceEvent::AddressResolved {
                rpa,
                identity,
                identity_type,
            } => self.resolve_address(rpa, identity, identity_type),
            DeviceEvent::NameResolveFailed { addr } => {
                if let Some(device) = self.devices.get_mut(&addr) {
                    device.name_resolve_failed(now);
                }
            }
            DeviceEvent::AdapterPowered { powered } => self.set_powered(powered),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_found(
        &mut self,
        addr: DeviceAddress,
        addr_type: AddressType,
        bearer: BearerType,
        rssi: Option<i8>,
        connectable: bool,
        data: &FoundData,
        now: Instant,
    ) {
        self.outbox.focus(addr);
        if !self.devices.contains_key(&addr) {
            let device = Device::new(addr, addr_type, now, &self.config);
            if self.devices.insert(addr, device).is_err() {
                defmt::warn!("device table full");
                return;
            }
        }
        let (config, outbox) = (&self.config, &mut self.outbox);
        let Some(device) = self.devices.get_mut(&addr) else {
            return;
        };

        match bearer {
            BearerType::BrEdr => device.set_bredr_support(),
            BearerType::Le => device.set_le_support(),
        }
        device.update_last_seen(bearer, now, config);
        if !connectable {
            let mut state = *device.bearer_state(bearer);
            state.connectable = false;
            device.restore_bearer_state(bearer, state);
        }

        if let Some(rssi) = rssi {
            if device.cache.set_rssi(rssi) {
                outbox.changed(Property::Rssi);
            }
        }
        if let Some(name) = &data.name {
            if device.cache.set_name(name.as_str()) {
                outbox.changed(Property::Name);
                // The observed name is cached even for temporary devices
                outbox.command(Command::StoreDevice { addr });
            }
        }
        if let Some(class) = data.class {
            if device.cache.set_class(class) {
                outbox.changed(Property::Class);
                outbox.changed(Property::Icon);
                device.mark_dirty();
            }
        }
        if let Some(appearance) = data.appearance {
            if device.cache.set_appearance(appearance) {
                outbox.changed(Property::Appearance);
                outbox.changed(Property::Icon);
                device.mark_dirty();
            }
        }
        if let Some(tx_power) = data.tx_power {
            if device.cache.set_tx_power(tx_power) {
                outbox.changed(Property::TxPower);
            }
        }
        if let Some(flags) = data.ad_flags {
            if device.cache.set_ad_flags(flags) {
                outbox.changed(Property::AdvertisingFlags);
            }
        }
        if let Some(legacy) = data.legacy_pairing {
            device.set_legacy_pairing(legacy, outbox);
        }
        if !data.uuids.is_empty() && device.cache.add_eir_uuids(&data.uuids) {
            // Only observable while no bearer has resolved services
            if !device.bearer_state(BearerType::BrEdr).svc_resolved
                && !device.bearer_state(BearerType::Le).svc_resolved
            {
                outbox.changed(Property::Uuids);
            }
        }

        let manufacturer: Vec<(u16, &[u8]), 4> = data
            .manufacturer_data
            .iter()
            .map(|(id, blob)| (*id, blob.as_slice()))
            .collect();
        if !manufacturer.is_empty()
            && device
                .cache
                .set_manufacturer_data(&manufacturer, data.replace_data)
        {
            outbox.changed(Property::ManufacturerData);
        }

        let service_data: Vec<(ServiceUuid, &[u8]), 4> = data
            .service_data
            .iter()
            .map(|(uuid, blob)| (*uuid, blob.as_slice()))
            .collect();
        if !service_data.is_empty()
            && device.cache.set_service_data(&service_data, data.replace_data)
        {
            outbox.changed(Property::ServiceData);
        }

        let adv: Vec<(u8, &[u8]), 4> = data
            .advertising_data
            .iter()
            .map(|(ad_type, blob)| (*ad_type, blob.as_slice()))
            .collect();
        if !adv.is_empty() && device.cache.set_advertising_data(&adv, data.replace_data) {
            outbox.changed(Property::AdvertisingData);
        }
    }

    fn resolve_address(
        &mut self,
        rpa: DeviceAddress,
        identity: DeviceAddress,
        identity_type: AddressType,
    ) {
        let Some(mut device) = self.devices.remove(&rpa) else {
            return;
        };

        if let Some(existing) = self.devices.get_mut(&identity) {
            // Both tracked: fold the newer sighting into the identity record
            defmt::debug!("merging duplicate device after address resolution");
            existing.restore_bearers(device.has_bredr(), device.has_le());
            let uuids: Vec<ServiceUuid, MAX_UUIDS> = device.uuids().iter().copied().collect();
            existing.restore_services(&uuids, device.primaries(), &self.profiles);
            if device.cache.name.as_str() != "" {
                existing.cache.set_name(device.cache.name.as_str());
            }
            return;
        }

        device.update_address(identity, identity_type);
        self.outbox.focus(identity);
        self.outbox.changed(Property::Address);
        self.outbox.changed(Property::AddressType);
        self.devices.insert(identity, device).ok();
    }

    fn set_powered(&mut self, powered: bool) {
        self.powered = powered;
        if powered {
            return;
        }

        // Power loss fails everything in flight
        for (addr, device) in &mut self.devices {
            self.outbox.focus(*addr);
            device.cancel_browse(&mut self.outbox);
            if device.bonding.is_some() {
                let id = device.bonding.as_ref().and_then(|b| b.id);
                device.cancel_authentication(true, &mut self.outbox);
                device.bonding = None;
                if let Some(id) = id {
                    self.outbox.reply(id, Err(DeviceError::NotReady));
                }
            }
        }
    }

    // ---- request processing ---------------------------------------------

    /// Apply one API request
    ///
    /// Returns the immediate response, or `None` when the reply was parked
    /// and will surface later as a [`Command::Reply`].
    #[allow(clippy::too_many_lines)]
    pub fn process_request(&mut self, request: Request, now: Instant) -> Option<Response> {
        let id = request.id;

        let complete = |result: Result<(), DeviceError>| Some(Response::Complete { id, result });

        match request.op {
            RequestOp::Connect { addr } => {
                self.outbox.focus(addr);
                let powered = self.powered;
                let adapter_bredr = self.adapter_bredr;
                let (config, profiles, outbox) = (&self.config, &self.profiles, &mut self.outbox);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                match device.connect(id, None, now, config, profiles, powered, adapter_bredr, outbox)
                {
                    Ok(()) => None,
                    Err(e) => complete(Err(e)),
                }
            }
            RequestOp::ConnectProfile { addr, uuid } => {
                self.outbox.focus(addr);
                let powered = self.powered;
                let adapter_bredr = self.adapter_bredr;
                let (config, profiles, outbox) = (&self.config, &self.profiles, &mut self.outbox);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                match device.connect(
                    id,
                    Some(uuid),
                    now,
                    config,
                    profiles,
                    powered,
                    adapter_bredr,
                    outbox,
                ) {
                    Ok(()) => None,
                    Err(e) => complete(Err(e)),
                }
            }
            RequestOp::Disconnect { addr } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                device.disconnect(id, now, &mut self.outbox);
                None
            }
            RequestOp::DisconnectProfile { addr, uuid } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                match device.disconnect_profile(id, uuid, &mut self.outbox) {
                    Ok(()) => None,
                    Err(e) => complete(Err(e)),
                }
            }
            RequestOp::Pair {
                addr,
                io_cap,
                agent_present,
            } => {
                self.outbox.focus(addr);
                if !self.powered {
                    return complete(Err(DeviceError::NotReady));
                }
                let adapter_bredr = self.adapter_bredr;
                let (config, outbox) = (&self.config, &mut self.outbox);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                match device.pair(id, io_cap, agent_present, now, config, adapter_bredr, outbox) {
                    Ok(()) => None,
                    Err(e) => complete(Err(e)),
                }
            }
            RequestOp::CancelPairing { addr } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                complete(device.cancel_pairing(&mut self.outbox))
            }
            RequestOp::Block { addr } => {
                self.outbox.focus(addr);
                let (config, profiles, outbox) = (&self.config, &self.profiles, &mut self.outbox);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                complete(device.set_blocked(true, now, config, profiles, outbox))
            }
            RequestOp::Unblock { addr } => {
                self.outbox.focus(addr);
                let (config, profiles, outbox) = (&self.config, &self.profiles, &mut self.outbox);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                complete(device.set_blocked(false, now, config, profiles, outbox))
            }
            RequestOp::SetTrusted { addr, trusted } => {
                self.outbox.focus(addr);
                let (config, outbox) = (&self.config, &mut self.outbox);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                device.set_trusted(trusted, now, config, outbox);
                complete(Ok(()))
            }
            RequestOp::SetAlias { addr, alias } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                device.set_alias(alias.as_str(), &mut self.outbox);
                complete(Ok(()))
            }
            RequestOp::SetWakeAllowed { addr, allowed } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                complete(device.set_wake_allowed(allowed, &mut self.outbox))
            }
            RequestOp::SetPreferredBearer { addr, prefer } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                complete(device.set_preferred_bearer(prefer, &mut self.outbox))
            }
            RequestOp::RemoveDevice {
                addr,
                remove_stored,
            } => {
                self.outbox.focus(addr);
                let Some(device) = self.devices.get_mut(&addr) else {
                    return complete(Err(DeviceError::DoesNotExist));
                };
                device.request_disconnect(None, now, &mut self.outbox);
                device.services.clear();
                self.devices.remove(&addr);
                if remove_stored {
                    self.outbox.command(Command::RemoveStore { addr });
                }
                complete(Ok(()))
            }
            RequestOp::GetDevice { addr } => {
                let result = self.snapshot(&addr).ok_or(DeviceError::DoesNotExist);
                Some(Response::Device { id, result })
            }
        }
    }

    // ---- timers ---------------------------------------------------------

    /// Fire due timers and flush debounced stores; call periodically
    pub fn tick(&mut self, now: Instant) {
        let mut expired: Vec<DeviceAddress, MAX_DEVICES> = Vec::new();

        for (addr, device) in &mut self.devices {
            self.outbox.focus(*addr);
            device.poll_timers(now, &mut self.outbox);

            if device.temporary_expired(now, &self.config) {
                expired.push(*addr).ok();
                continue;
            }

            if device.take_store_pending() {
                self.outbox.command(Command::StoreDevice { addr: *addr });
            }
        }

        for addr in expired {
            defmt::debug!("temporary device expired");
            self.devices.remove(&addr);
        }
    }

    /// The profile table, for embedders wiring service handlers
    #[must_use]
    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AgentReply, BondingStatus, DisconnectReason, RequestId,
        bonding::IoCapability,
        browse::SdpBatch,
        error::DeviceError,
        service::ServiceState,
        uuid::{UUID_AUDIO_SINK, UUID_AUDIO_SOURCE, UUID_HID},
    };
    use embassy_time::Duration;

    const SPEAKER: DeviceAddress = DeviceAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0x01]);
    const LE_PEER: DeviceAddress = DeviceAddress::new([0xBB, 0xBB, 0xBB, 0xBB, 0xBB, 0x02]);

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    fn registry_with_a2dp() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new(RegistryConfig::default());
        registry
            .register_profile(Profile {
                uuid: UUID_AUDIO_SINK,
                name: "a2dp-sink",
                priority: 10,
                auto_connect: true,
                external: false,
                wake_support: false,
            })
            .unwrap();
        registry
            .register_profile(Profile {
                uuid: UUID_AUDIO_SOURCE,
                name: "a2dp-source",
                priority: 5,
                auto_connect: false,
                external: false,
                wake_support: false,
            })
            .unwrap();
        registry
    }

    fn found_bredr(addr: DeviceAddress, name: &str, class: u32) -> DeviceEvent {
        let mut data = FoundData::default();
        if !name.is_empty() {
            let mut s = String::new();
            s.push_str(name).unwrap();
            data.name = Some(s);
        }
        data.class = Some(class);
        DeviceEvent::Found {
            addr,
            addr_type: AddressType::BrEdr,
            bearer: BearerType::BrEdr,
            rssi: Some(-55),
            connectable: true,
            data,
        }
    }

    fn commands(registry: &mut DeviceRegistry) -> Vec<Command, 32> {
        let mut out = registry.drain_outbox();
        let mut all: Vec<Command, 32> = Vec::new();
        for c in out.take_commands() {
            all.push(c).ok();
        }
        for (addr, property) in out.take_changes() {
            all.push(Command::PropertyChanged { addr, property }).ok();
        }
        all
    }

    fn has_change(cmds: &[Command], want_addr: DeviceAddress, want: Property) -> bool {
        cmds.iter().any(|c| {
            matches!(c, Command::PropertyChanged { addr, property } if *addr == want_addr && *property == want)
        })
    }

    fn count_change(cmds: &[Command], want_addr: DeviceAddress, want: Property) -> usize {
        cmds.iter()
            .filter(|c| {
                matches!(c, Command::PropertyChanged { addr, property } if *addr == want_addr && *property == want)
            })
            .count()
    }

    fn reply_for(cmds: &[Command], want: RequestId) -> Option<Result<(), DeviceError>> {
        cmds.iter().find_map(|c| match c {
            Command::Reply { id, result } if *id == want => Some(*result),
            _ => None,
        })
    }

    /// BR/EDR pairing end to end: pair, bond, browse, attach, resolve.
    #[test]
    fn test_s1_bredr_pair_flow() {
        let mut registry = registry_with_a2dp();
        let now = at(100);

        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0x0024_0404), now);
        let _ = commands(&mut registry);

        // pair() with a NoInputNoOutput agent
        let resp = registry.process_request(
            Request {
                id: RequestId(1),
                op: RequestOp::Pair {
                    addr: SPEAKER,
                    io_cap: IoCapability::NoInputNoOutput,
                    agent_present: true,
                },
            },
            now,
        );
        assert!(resp.is_none(), "pair reply must be parked");

        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::CreateBonding {
                addr,
                addr_type: AddressType::BrEdr,
                io_cap: IoCapability::NoInputNoOutput,
            } if *addr == SPEAKER
        )));

        // Link comes up, management reports success
        registry.handle_event(
            DeviceEvent::Connected {
                addr: SPEAKER,
                bearer: BearerType::BrEdr,
                initiator: true,
            },
            at(101),
        );
        let _ = commands(&mut registry);

        registry.handle_event(
            DeviceEvent::BondingComplete {
                addr: SPEAKER,
                bearer: BearerType::BrEdr,
                status: BondingStatus::Success,
            },
            at(102),
        );

        {
            let dev = registry.device(&SPEAKER).unwrap();
            assert!(dev.is_paired());
            assert!(dev.is_bonded());
            assert!(!dev.is_trusted());
            assert!(!dev.is_temporary());
        }

        // Services unresolved: SDP browse starts, Paired is deferred
        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::SdpSearch { addr, uuid } if *addr == SPEAKER && *uuid == crate::uuid::UUID_L2CAP
        )));
        assert!(!has_change(&cmds, SPEAKER, Property::Paired));

        // Walk the SDP sequence: first search yields the A2DP uuids
        let mut batch = SdpBatch::default();
        batch.uuids.push(UUID_AUDIO_SOURCE).unwrap();
        batch.uuids.push(UUID_AUDIO_SINK).unwrap();
        registry.handle_event(
            DeviceEvent::SdpResult {
                addr: SPEAKER,
                result: Ok(batch),
            },
            at(103),
        );
        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::SdpSearch { uuid, .. } if *uuid == crate::uuid::UUID_PNP_INFO
        )));

        registry.handle_event(
            DeviceEvent::SdpResult {
                addr: SPEAKER,
                result: Ok(SdpBatch::default()),
            },
            at(104),
        );
        let _ = commands(&mut registry);
        registry.handle_event(
            DeviceEvent::SdpResult {
                addr: SPEAKER,
                result: Ok(SdpBatch::default()),
            },
            at(105),
        );

        let cmds = commands(&mut registry);
        // Browse finished: deferred Paired emitted exactly once, pair replied
        assert_eq!(count_change(&cmds, SPEAKER, Property::Paired), 1);
        assert!(has_change(&cmds, SPEAKER, Property::ServicesResolved));
        assert_eq!(reply_for(&cmds, RequestId(1)), Some(Ok(())));

        let dev = registry.device(&SPEAKER).unwrap();
        assert!(dev.services_resolved());
        assert!(dev.uuids().contains(&UUID_AUDIO_SINK));
        assert!(dev.uuids().contains(&UUID_AUDIO_SOURCE));
        // One service attached for the sink profile
        assert_eq!(dev.services.len(), 2);
        assert!(dev.services.find_by_uuid(UUID_AUDIO_SINK).is_some());

        // Promotion wrote the info record
        registry.tick(at(106));
        let cmds = commands(&mut registry);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::StoreDevice { addr } if *addr == SPEAKER)));
    }

    /// LE pairing defers the Paired signal to discovery completion.
    #[test]
    fn test_s2_le_pair_deferred_paired() {
        let mut registry = registry_with_a2dp();
        let now = at(200);

        registry.handle_event(
            DeviceEvent::Found {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                bearer: BearerType::Le,
                rssi: Some(-60),
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        let _ = commands(&mut registry);

        let resp = registry.process_request(
            Request {
                id: RequestId(2),
                op: RequestOp::Pair {
                    addr: LE_PEER,
                    io_cap: IoCapability::NoInputNoOutput,
                    agent_present: true,
                },
            },
            now,
        );
        assert!(resp.is_none());

        // ATT first, because key exchange rides it
        let cmds = commands(&mut registry);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::AttConnect { addr, .. } if *addr == LE_PEER)));

        registry.handle_event(
            DeviceEvent::Connected {
                addr: LE_PEER,
                bearer: BearerType::Le,
                initiator: true,
            },
            at(201),
        );
        let _ = commands(&mut registry);

        registry.handle_event(
            DeviceEvent::BondingComplete {
                addr: LE_PEER,
                bearer: BearerType::Le,
                status: BondingStatus::Success,
            },
            at(202),
        );
        let cmds = commands(&mut registry);
        // No Paired signal yet: GATT discovery starts instead
        assert!(!has_change(&cmds, LE_PEER, Property::Paired));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::GattDiscover { addr } if *addr == LE_PEER)));
        assert!(!registry.device(&LE_PEER).unwrap().services_resolved());

        let mut primaries = Vec::new();
        primaries
            .push(crate::browse::GattPrimary {
                uuid: crate::uuid::UUID_GATT,
                start_handle: 0x0001,
                end_handle: 0x000F,
            })
            .unwrap();
        registry.handle_event(
            DeviceEvent::GattReady {
                addr: LE_PEER,
                primaries,
            },
            at(203),
        );

        let cmds = commands(&mut registry);
        assert_eq!(count_change(&cmds, LE_PEER, Property::Paired), 1);
        assert!(has_change(&cmds, LE_PEER, Property::ServicesResolved));
        assert_eq!(reply_for(&cmds, RequestId(2)), Some(Ok(())));
        assert!(registry.device(&LE_PEER).unwrap().services_resolved());
    }

    /// A BR/EDR page timeout falls back to LE without failing the caller.
    #[test]
    fn test_s3_bearer_fallback() {
        let mut registry = registry_with_a2dp();
        let now = at(300);
        let dual = DeviceAddress::new([0xCC, 0, 0, 0, 0, 3]);

        // Seen on both bearers recently; freshness tie picks BR/EDR
        registry.handle_event(found_bredr(dual, "Dual", 0x0024_0404), now);
        registry.handle_event(
            DeviceEvent::Found {
                addr: dual,
                addr_type: AddressType::BrEdr,
                bearer: BearerType::Le,
                rssi: None,
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        let _ = commands(&mut registry);

        let resp = registry.process_request(
            Request {
                id: RequestId(3),
                op: RequestOp::Connect { addr: dual },
            },
            now,
        );
        assert!(resp.is_none());

        // Unresolved BR/EDR: connect() goes through SDP first
        let cmds = commands(&mut registry);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::SdpSearch { addr, .. } if *addr == dual)));

        // Page timeout surfaces as a connection attempt failure
        registry.handle_event(
            DeviceEvent::SdpResult {
                addr: dual,
                result: Err(DeviceError::ConnectionAttemptFailed),
            },
            at(301),
        );
        let cmds = commands(&mut registry);
        // No error reply: the controller falls back to LE
        assert_eq!(reply_for(&cmds, RequestId(3)), None);
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::AttConnect { addr, .. } if *addr == dual)));

        // LE link comes up: the parked connect() succeeds
        registry.handle_event(
            DeviceEvent::Connected {
                addr: dual,
                bearer: BearerType::Le,
                initiator: true,
            },
            at(302),
        );
        let cmds = commands(&mut registry);
        assert_eq!(reply_for(&cmds, RequestId(3)), Some(Ok(())));
    }

    /// Losing the link while paired-but-unbonded drops the pairing, with
    /// exactly one Paired change when the other bearer was unpaired.
    #[test]
    fn test_s4_unpair_on_partial_disconnect() {
        let mut registry = registry_with_a2dp();
        let now = at(400);

        registry.handle_event(
            DeviceEvent::Found {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                bearer: BearerType::Le,
                rssi: None,
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        registry.handle_event(
            DeviceEvent::Connected {
                addr: LE_PEER,
                bearer: BearerType::Le,
                initiator: false,
            },
            now,
        );
        let _ = commands(&mut registry);

        // Paired this session, but the keys were never persisted
        {
            let device = registry.device_mut(&LE_PEER).unwrap();
            let mut state = *device.bearer_state(BearerType::Le);
            state.paired = true;
            state.bonded = false;
            state.svc_resolved = true;
            device.restore_bearer_state(BearerType::Le, state);
        }

        registry.handle_event(
            DeviceEvent::Disconnected {
                addr: LE_PEER,
                bearer: BearerType::Le,
                reason: DisconnectReason::Remote,
            },
            at(401),
        );

        let cmds = commands(&mut registry);
        assert_eq!(count_change(&cmds, LE_PEER, Property::Paired), 1);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::RemoveBonding { addr, .. } if *addr == LE_PEER
        )));
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::EmitDisconnected { addr, reason: DisconnectReason::Remote } if *addr == LE_PEER
        )));

        let dev = registry.device(&LE_PEER).unwrap();
        assert!(!dev.is_paired());
        assert!(!dev.bearer_state(BearerType::Le).paired);
    }

    /// Blocking tears services down and survives re-scan; unblocking
    /// re-probes without connecting anything.
    #[test]
    fn test_s5_block_unblock() {
        let mut registry = registry_with_a2dp();
        let now = at(500);

        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0x0024_0404), now);
        let _ = commands(&mut registry);

        // Resolve services so a service exists to tear down
        {
            let profiles = &registry.profiles;
            let device = registry.devices.get_mut(&SPEAKER).unwrap();
            device.restore_services(&[UUID_AUDIO_SINK], &[], profiles);
            let idx = device.services.find_by_uuid(UUID_AUDIO_SINK).unwrap();
            device.services.set_state(idx, ServiceState::Connected);
        }

        let resp = registry.process_request(
            Request {
                id: RequestId(5),
                op: RequestOp::Block { addr: SPEAKER },
            },
            now,
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(5),
                result: Ok(())
            })
        );

        let cmds = commands(&mut registry);
        assert!(has_change(&cmds, SPEAKER, Property::Blocked));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::BlockLink { addr, .. } if *addr == SPEAKER)));
        assert!(cmds
            .iter()
            .any(|c| matches!(c, Command::DisconnectService { addr, uuid } if *addr == SPEAKER && *uuid == UUID_AUDIO_SINK)));

        {
            let dev = registry.device(&SPEAKER).unwrap();
            assert!(dev.is_blocked());
            assert!(!dev.is_temporary());
            assert!(dev.services.is_empty());
        }

        // Still registered, still blocked after a re-scan
        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0x0024_0404), at(501));
        assert!(registry.device(&SPEAKER).unwrap().is_blocked());

        let resp = registry.process_request(
            Request {
                id: RequestId(6),
                op: RequestOp::Unblock { addr: SPEAKER },
            },
            at(502),
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(6),
                result: Ok(())
            })
        );

        let cmds = commands(&mut registry);
        assert!(has_change(&cmds, SPEAKER, Property::Blocked));
        // Profiles re-probed against resolved UUIDs, but nothing connects
        assert!(!cmds
            .iter()
            .any(|c| matches!(c, Command::ConnectService { .. })));
        let dev = registry.device(&SPEAKER).unwrap();
        assert!(!dev.is_blocked());
        assert!(dev.services.find_by_uuid(UUID_AUDIO_SINK).is_some());
        assert!(!dev.services.any_busy());
    }

    /// A stale signed-write counter is rejected without mutation or
    /// property change.
    #[test]
    fn test_s6_csrk_monotonicity() {
        let mut registry = registry_with_a2dp();
        let now = at(600);

        registry.handle_event(
            DeviceEvent::Found {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                bearer: BearerType::Le,
                rssi: None,
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        registry.handle_event(
            DeviceEvent::SignatureKey {
                addr: LE_PEER,
                kind: 0x01,
                key: [0x5A; 16],
                counter: 5,
                store_hint: false,
            },
            now,
        );
        let _ = commands(&mut registry);

        registry.handle_event(
            DeviceEvent::SignedWrite {
                addr: LE_PEER,
                counter: 4,
            },
            at(601),
        );

        let cmds = commands(&mut registry);
        assert!(cmds.is_empty(), "rejected write must not emit anything");
        assert_eq!(
            registry
                .device(&LE_PEER)
                .unwrap()
                .keys
                .remote_csrk
                .unwrap()
                .counter,
            5
        );
    }

    /// An idle temporary device disappears after its TTL.
    #[test]
    fn test_temporary_device_expires() {
        let mut registry = registry_with_a2dp();
        let now = at(700);

        registry.handle_event(found_bredr(SPEAKER, "", 0), now);
        assert_eq!(registry.len(), 1);

        let ttl = RegistryConfig::default().temporary_timeout;
        registry.tick(now + ttl - Duration::from_secs(1));
        assert_eq!(registry.len(), 1);

        registry.tick(now + ttl);
        assert_eq!(registry.len(), 0);
    }

    /// A temporary device with a busy service gets extra time.
    #[test]
    fn test_temporary_extension_while_service_busy() {
        let mut registry = registry_with_a2dp();
        let now = at(800);

        registry.handle_event(found_bredr(SPEAKER, "", 0), now);
        {
            let profiles = &registry.profiles;
            let device = registry.devices.get_mut(&SPEAKER).unwrap();
            device.restore_services(&[UUID_AUDIO_SINK], &[], profiles);
            let idx = device.services.find_by_uuid(UUID_AUDIO_SINK).unwrap();
            device.services.set_state(idx, ServiceState::Connecting);
        }

        let ttl = RegistryConfig::default().temporary_timeout;
        registry.tick(now + ttl);
        assert_eq!(registry.len(), 1, "busy service extends the timer");

        {
            let device = registry.device_mut(&SPEAKER).unwrap();
            let idx = device.services.find_by_uuid(UUID_AUDIO_SINK).unwrap();
            device.services.set_state(idx, ServiceState::Disconnected);
        }
        registry.tick(now + ttl + ttl);
        assert_eq!(registry.len(), 0);
    }

    /// Browse and bonding exclude a second in-flight request.
    #[test]
    fn test_in_progress_exclusion() {
        let mut registry = registry_with_a2dp();
        let now = at(900);

        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0x0024_0404), now);
        let _ = commands(&mut registry);

        assert!(registry
            .process_request(
                Request {
                    id: RequestId(10),
                    op: RequestOp::Pair {
                        addr: SPEAKER,
                        io_cap: IoCapability::NoInputNoOutput,
                        agent_present: false,
                    },
                },
                now,
            )
            .is_none());

        // Second pair while bonding is active
        let resp = registry.process_request(
            Request {
                id: RequestId(11),
                op: RequestOp::Pair {
                    addr: SPEAKER,
                    io_cap: IoCapability::NoInputNoOutput,
                    agent_present: false,
                },
            },
            now,
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(11),
                result: Err(DeviceError::InProgress)
            })
        );

        // connect() is also excluded while bonding
        let resp = registry.process_request(
            Request {
                id: RequestId(12),
                op: RequestOp::Connect { addr: SPEAKER },
            },
            now,
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(12),
                result: Err(DeviceError::InProgress)
            })
        );
    }

    /// Pairing an already bonded bearer fails with AlreadyExists.
    #[test]
    fn test_pair_already_bonded() {
        let mut registry = registry_with_a2dp();
        let now = at(1000);

        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0), now);
        {
            let device = registry.device_mut(&SPEAKER).unwrap();
            let mut state = *device.bearer_state(BearerType::BrEdr);
            state.paired = true;
            state.bonded = true;
            device.restore_bearer_state(BearerType::BrEdr, state);
        }
        let _ = commands(&mut registry);

        let resp = registry.process_request(
            Request {
                id: RequestId(20),
                op: RequestOp::Pair {
                    addr: SPEAKER,
                    io_cap: IoCapability::NoInputNoOutput,
                    agent_present: false,
                },
            },
            now,
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(20),
                result: Err(DeviceError::AlreadyExists)
            })
        );
    }

    /// Just-works re-pairing is auto-rejected under the Never policy.
    #[test]
    fn test_jw_repairing_auto_reject() {
        let mut registry = registry_with_a2dp();
        let now = at(1100);

        registry.handle_event(
            DeviceEvent::Found {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                bearer: BearerType::Le,
                rssi: None,
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        {
            let device = registry.device_mut(&LE_PEER).unwrap();
            let mut state = *device.bearer_state(BearerType::Le);
            state.paired = true;
            device.restore_bearer_state(BearerType::Le, state);
        }
        let _ = commands(&mut registry);

        registry.handle_event(
            DeviceEvent::ConfirmRequested {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                passkey: 0,
                confirm_hint: true,
            },
            now,
        );

        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::ConfirmReply { addr, accept: false, .. } if *addr == LE_PEER
        )));
    }

    /// RSSI movement below the delta threshold stays silent.
    #[test]
    fn test_rssi_hysteresis() {
        let mut registry = registry_with_a2dp();
        let now = at(1200);

        registry.handle_event(found_bredr(SPEAKER, "", 0), now);
        let _ = commands(&mut registry);

        let mut small_move = found_bredr(SPEAKER, "", 0);
        if let DeviceEvent::Found { rssi, .. } = &mut small_move {
            *rssi = Some(-58); // was -55
        }
        registry.handle_event(small_move, at(1201));
        let cmds = commands(&mut registry);
        assert!(!has_change(&cmds, SPEAKER, Property::Rssi));

        let mut big_move = found_bredr(SPEAKER, "", 0);
        if let DeviceEvent::Found { rssi, .. } = &mut big_move {
            *rssi = Some(-70);
        }
        registry.handle_event(big_move, at(1202));
        let cmds = commands(&mut registry);
        assert!(has_change(&cmds, SPEAKER, Property::Rssi));
    }

    /// Power loss cancels in-flight work with NotReady.
    #[test]
    fn test_power_down_fails_inflight() {
        let mut registry = registry_with_a2dp();
        let now = at(1300);

        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0), now);
        let _ = commands(&mut registry);

        assert!(registry
            .process_request(
                Request {
                    id: RequestId(30),
                    op: RequestOp::Pair {
                        addr: SPEAKER,
                        io_cap: IoCapability::NoInputNoOutput,
                        agent_present: false,
                    },
                },
                now,
            )
            .is_none());
        let _ = commands(&mut registry);

        registry.handle_event(DeviceEvent::AdapterPowered { powered: false }, at(1301));
        let cmds = commands(&mut registry);
        assert_eq!(
            reply_for(&cmds, RequestId(30)),
            Some(Err(DeviceError::NotReady))
        );

        // New work is refused while unpowered
        let resp = registry.process_request(
            Request {
                id: RequestId(31),
                op: RequestOp::Pair {
                    addr: SPEAKER,
                    io_cap: IoCapability::NoInputNoOutput,
                    agent_present: false,
                },
            },
            at(1302),
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(31),
                result: Err(DeviceError::NotReady)
            })
        );
    }

    /// Snapshot readout carries the derived icon and alias fallback.
    #[test]
    fn test_snapshot_readout() {
        let mut registry = registry_with_a2dp();
        registry.handle_event(found_bredr(SPEAKER, "Speaker", 0x0024_0404), at(1400));

        let snap = registry.snapshot(&SPEAKER).unwrap();
        assert_eq!(snap.name.as_str(), "Speaker");
        assert_eq!(snap.alias.as_str(), "Speaker");
        assert_eq!(snap.icon, Some("audio-headset"));
        assert_eq!(snap.class, Some(0x0024_0404));
        assert!(!snap.paired);

        assert!(registry.snapshot(&LE_PEER).is_none());
    }

    /// HID probing grants wake support and the override applies on bond.
    #[test]
    fn test_wake_support_via_hid_profile() {
        let mut registry = registry_with_a2dp();
        registry
            .register_profile(Profile {
                uuid: UUID_HID,
                name: "hid",
                priority: 20,
                auto_connect: true,
                external: false,
                wake_support: true,
            })
            .unwrap();

        let now = at(1500);
        registry.handle_event(found_bredr(SPEAKER, "Keyboard", 0x0000_0540), now);
        {
            let profiles = &registry.profiles;
            let device = registry.devices.get_mut(&SPEAKER).unwrap();
            device.restore_services(&[UUID_HID], &[], profiles);
        }

        // Wake is unsupported territory until the device is persistent
        let resp = registry.process_request(
            Request {
                id: RequestId(40),
                op: RequestOp::SetWakeAllowed {
                    addr: SPEAKER,
                    allowed: true,
                },
            },
            now,
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(40),
                result: Err(DeviceError::Unsupported)
            })
        );

        {
            let config = registry.config;
            let device = registry.devices.get_mut(&SPEAKER).unwrap();
            let mut out = Outbox::new();
            device.set_temporary(false, now, &config, &mut out);
        }
        let _ = commands(&mut registry);

        let resp = registry.process_request(
            Request {
                id: RequestId(41),
                op: RequestOp::SetWakeAllowed {
                    addr: SPEAKER,
                    allowed: true,
                },
            },
            now,
        );
        assert_eq!(
            resp,
            Some(Response::Complete {
                id: RequestId(41),
                result: Ok(())
            })
        );
        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::SetDeviceFlags { addr, flags } if *addr == SPEAKER && flags & crate::device::DEVICE_FLAG_REMOTE_WAKEUP != 0
        )));

        // Kernel confirms: WakeAllowed rises exactly once
        registry.handle_event(
            DeviceEvent::FlagsChanged {
                addr: SPEAKER,
                supported: crate::device::DEVICE_FLAG_REMOTE_WAKEUP,
                current: crate::device::DEVICE_FLAG_REMOTE_WAKEUP,
            },
            at(1501),
        );
        let cmds = commands(&mut registry);
        assert_eq!(count_change(&cmds, SPEAKER, Property::WakeAllowed), 1);
        assert!(registry.device(&SPEAKER).unwrap().wake_allowed());

        // Re-applying the same flags is idempotent
        registry.handle_event(
            DeviceEvent::FlagsChanged {
                addr: SPEAKER,
                supported: crate::device::DEVICE_FLAG_REMOTE_WAKEUP,
                current: crate::device::DEVICE_FLAG_REMOTE_WAKEUP,
            },
            at(1502),
        );
        let cmds = commands(&mut registry);
        assert_eq!(count_change(&cmds, SPEAKER, Property::WakeAllowed), 0);
    }

    /// An agent confirm reply reaches the management layer.
    #[test]
    fn test_confirm_agent_round_trip() {
        let mut registry = registry_with_a2dp();
        let now = at(1600);

        registry.handle_event(
            DeviceEvent::Found {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                bearer: BearerType::Le,
                rssi: None,
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        let _ = commands(&mut registry);

        registry.handle_event(
            DeviceEvent::ConfirmRequested {
                addr: LE_PEER,
                addr_type: AddressType::LePublic,
                passkey: 123_456,
                confirm_hint: false,
            },
            now,
        );
        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::AgentRequestConfirmation { addr, passkey: 123_456 } if *addr == LE_PEER
        )));

        registry.handle_event(
            DeviceEvent::AgentReplied {
                addr: LE_PEER,
                reply: AgentReply::Confirm(true),
            },
            at(1601),
        );
        let cmds = commands(&mut registry);
        assert!(cmds.iter().any(|c| matches!(
            c,
            Command::ConfirmReply { addr, accept: true, .. } if *addr == LE_PEER
        )));
        assert!(registry.device(&LE_PEER).unwrap().authr.is_none());
    }

    /// RPA resolution rekeys the device under its identity address.
    #[test]
    fn test_address_resolution_rekeys_device() {
        let mut registry = registry_with_a2dp();
        let now = at(1700);
        let rpa = DeviceAddress::new([0x52, 0x11, 0x22, 0x33, 0x44, 0x55]);

        registry.handle_event(
            DeviceEvent::Found {
                addr: rpa,
                addr_type: AddressType::LeRandom,
                bearer: BearerType::Le,
                rssi: None,
                connectable: true,
                data: FoundData::default(),
            },
            now,
        );
        assert!(registry.device(&rpa).is_some());

        registry.handle_event(
            DeviceEvent::AddressResolved {
                rpa,
                identity: LE_PEER,
                identity_type: AddressType::LePublic,
            },
            at(1701),
        );

        assert!(registry.device(&rpa).is_none());
        let dev = registry.device(&LE_PEER).unwrap();
        assert_eq!(dev.address(), LE_PEER);
        assert_eq!(dev.address_type(), AddressType::LePublic);
        assert!(!dev.is_rpa());
    }
}
