//! The per-device state machine
//!
//! A [`Device`] is one remote peer as seen by the host: up to two bearers,
//! the advertising cache, key material, attached services and the named
//! in-flight operation slots (`browse`, `bonding`, `authr`, `connect`,
//! `disconnect`). Every public operation mutates the device under the
//! registry lock and pushes its side effects (adapter commands, agent
//! prompts, storage triggers, property changes) into the [`Outbox`].
//!
//! ## Invariants
//!
//! - at least one bearer is present;
//! - at most one of browse/bonding/connect is in flight, extra requests
//!   fail with `InProgress`;
//! - a temporary device is never bonded or trusted;
//! - `bonded` implies `paired` per bearer;
//! - a disconnect that leaves a bearer paired-but-unbonded clears that
//!   bearer's paired state and drops its stored bonding material.

use embassy_time::Instant;
use heapless::Vec;

use crate::{
    AddressType, BearerState, BearerType, BearerView, BondingStatus, Command, DeviceAddress,
    DeviceError, DisconnectReason, Outbox, PreferredBearer, Property, RequestId,
    bearer::{select_connect_bearer, select_pair_bearer},
    bonding::{
        AuthKind, AuthenticationRequest, BondingRequest, ConfirmAction, IoCapability,
        confirm_action,
    },
    browse::{BrowseKind, BrowseOutcome, BrowseRequest, BrowseWaiter, BrowseWaiterOp, GattPrimary, SdpBatch},
    cache::AdvertisingCache,
    config::RegistryConfig,
    constants::{DISCONNECT_GRACE, DISCOVERY_DEFER, MAX_PRIMARIES, MAX_UUIDS},
    keys::{CsrkKind, KeyStore},
    service::{ProfileTable, ServiceSet, ServiceState},
    uuid::ServiceUuid,
};

/// Device flag bit: the remote may wake the host from suspend
pub const DEVICE_FLAG_REMOTE_WAKEUP: u32 = 1 << 0;

/// User override for the remote-wakeup flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, defmt::Format)]
pub enum WakeOverride {
    /// Follow profile support
    #[default]
    Default,
    /// Force wake on
    Enabled,
    /// Force wake off
    Disabled,
}

/// An in-flight connect request
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest {
    /// Reply token
    pub id: RequestId,
    /// Bearer the connect targets
    pub bearer: BearerType,
    /// Restriction to a single profile
    pub uuid: Option<ServiceUuid>,
}

/// One remote device tracked by the registry
#[derive(Debug)]
pub struct Device {
    address: DeviceAddress,
    address_type: AddressType,
    rpa: bool,
    conn_address: Option<(DeviceAddress, AddressType)>,

    bredr: bool,
    le: bool,
    bredr_state: BearerState,
    le_state: BearerState,
    prefer_bearer: PreferredBearer,

    /// Identity and advertising data
    pub cache: AdvertisingCache,
    /// Security material
    pub keys: KeyStore,
    /// Attached services, priority ordered
    pub services: ServiceSet,

    uuids: Vec<ServiceUuid, MAX_UUIDS>,
    primaries: Vec<GattPrimary, MAX_PRIMARIES>,

    temporary: bool,
    trusted: bool,
    blocked: bool,
    cable_pairing: bool,
    legacy_pairing: bool,
    auto_connect: bool,
    disable_auto_connect: bool,

    wake_support: bool,
    wake_allowed: bool,
    pending_wake_allowed: Option<bool>,
    wake_override: WakeOverride,
    supported_flags: u32,
    pending_flags: u32,
    current_flags: u32,

    svc_refreshed: bool,
    pending_paired: bool,
    att_connected: bool,
    gatt_ready: bool,
    svc_chng_ccc_bredr: u16,
    svc_chng_ccc_le: u16,

    /// In-flight discovery
    pub browse: Option<BrowseRequest>,
    /// In-flight bonding
    pub bonding: Option<BondingRequest>,
    /// In-flight credential prompt
    pub authr: Option<AuthenticationRequest>,
    connect_req: Option<ConnectRequest>,
    disconnect_req: Option<RequestId>,

    disconn_timer: Option<Instant>,
    discov_timer: Option<Instant>,
    temporary_timer: Option<Instant>,
    store_pending: bool,
    name_resolve_failed: Option<Instant>,
}

impl Device {
    /// Create a device from its first sighting; it starts temporary
    #[must_use]
    pub fn new(address: DeviceAddress, address_type: AddressType, now: Instant, cfg: &RegistryConfig) -> Self {
        let mut dev = Self {
            address,
            address_type,
            rpa: address.is_resolvable_private(address_type),
            conn_address: None,
            bredr: address_type == AddressType::BrEdr,
            le: address_type.is_le(),
            bredr_state: BearerState::default(),
            le_state: BearerState::default(),
            prefer_bearer: PreferredBearer::default(),
            cache: AdvertisingCache::default(),
            keys: KeyStore::default(),
            services: ServiceSet::new(),
            uuids: Vec::new(),
            primaries: Vec::new(),
            temporary: true,
            trusted: false,
            blocked: false,
            cable_pairing: false,
            legacy_pairing: false,
            auto_connect: false,
            disable_auto_connect: false,
            wake_support: false,
            wake_allowed: false,
            pending_wake_allowed: None,
            wake_override: WakeOverride::Default,
            supported_flags: 0,
            pending_flags: 0,
            current_flags: 0,
            svc_refreshed: false,
            pending_paired: false,
            att_connected: false,
            gatt_ready: false,
            svc_chng_ccc_bredr: 0,
            svc_chng_ccc_le: 0,
            browse: None,
            bonding: None,
            authr: None,
            connect_req: None,
            disconnect_req: None,
            disconn_timer: None,
            discov_timer: None,
            temporary_timer: None,
            store_pending: false,
            name_resolve_failed: None,
        };
        dev.temporary_timer = Some(now + cfg.temporary_timeout);
        dev
    }

    // ---- identity ------------------------------------------------------

    /// The identity address
    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// The identity address type
    #[must_use]
    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    /// Whether the current address is a resolvable private address
    #[must_use]
    pub fn is_rpa(&self) -> bool {
        self.rpa
    }

    /// Address used by the current or latest connection
    #[must_use]
    pub fn conn_address(&self) -> Option<(DeviceAddress, AddressType)> {
        self.conn_address
    }

    /// Whether persistent state may exist for this device
    #[must_use]
    pub fn is_storable(&self) -> bool {
        !self.temporary && !self.address.is_private(self.address_type)
    }

    /// Update the identity address after RPA resolution
    pub fn update_address(&mut self, address: DeviceAddress, address_type: AddressType) {
        self.address = address;
        self.address_type = address_type;
        self.rpa = address.is_resolvable_private(address_type);
    }

    // ---- bearer access -------------------------------------------------

    /// Whether the BR/EDR bearer is present
    #[must_use]
    pub fn has_bredr(&self) -> bool {
        self.bredr
    }

    /// Whether the LE bearer is present
    #[must_use]
    pub fn has_le(&self) -> bool {
        self.le
    }

    /// State of one bearer
    #[must_use]
    pub fn bearer_state(&self, bearer: BearerType) -> &BearerState {
        match bearer {
            BearerType::BrEdr => &self.bredr_state,
            BearerType::Le => &self.le_state,
        }
    }

    fn bearer_state_mut(&mut self, bearer: BearerType) -> &mut BearerState {
        match bearer {
            BearerType::BrEdr => &mut self.bredr_state,
            BearerType::Le => &mut self.le_state,
        }
    }

    fn bearer_view(&self, adapter_bredr: bool) -> BearerView<'_> {
        BearerView {
            bredr: self.bredr.then_some(&self.bredr_state),
            le: self.le.then_some(&self.le_state),
            addr_type: self.address_type,
            adapter_bredr,
        }
    }

    /// Record BR/EDR support discovered at runtime
    pub fn set_bredr_support(&mut self) {
        if !self.bredr {
            self.bredr = true;
            self.mark_dirty();
        }
    }

    /// Record LE support discovered at runtime
    pub fn set_le_support(&mut self) {
        if !self.le {
            self.le = true;
            self.mark_dirty();
        }
    }

    // ---- observables ---------------------------------------------------

    /// The Paired observable: either bearer is paired
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.bredr_state.paired || self.le_state.paired
    }

    /// The Bonded observable: either bearer is bonded
    #[must_use]
    pub fn is_bonded(&self) -> bool {
        self.bredr_state.bonded || self.le_state.bonded
    }

    /// The Connected observable: either bearer is connected
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.bredr_state.connected || self.le_state.connected
    }

    /// The ServicesResolved observable
    ///
    /// True only while connected with completed discovery; cleared on
    /// disconnect even though the per-bearer resolved flags persist.
    #[must_use]
    pub fn services_resolved(&self) -> bool {
        self.svc_refreshed
    }

    /// The UUIDs observable: resolved UUIDs once any bearer resolved
    /// services, the EIR-observed set before that
    #[must_use]
    pub fn observable_uuids(&self) -> Vec<ServiceUuid, MAX_UUIDS> {
        if self.bredr_state.svc_resolved || self.le_state.svc_resolved {
            self.uuids.clone()
        } else {
            self.cache.eir_uuids.iter().copied().collect()
        }
    }

    /// Resolved service UUIDs
    #[must_use]
    pub fn uuids(&self) -> &[ServiceUuid] {
        &self.uuids
    }

    /// Primary GATT services
    #[must_use]
    pub fn primaries(&self) -> &[GattPrimary] {
        &self.primaries
    }

    /// Whether the device is still temporary
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// The Trusted observable
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    /// The Blocked observable
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// The CablePairing observable
    #[must_use]
    pub fn is_cable_pairing(&self) -> bool {
        self.cable_pairing
    }

    /// The LegacyPairing observable
    #[must_use]
    pub fn is_legacy_pairing(&self) -> bool {
        self.legacy_pairing
    }

    /// The WakeAllowed observable
    #[must_use]
    pub fn wake_allowed(&self) -> bool {
        self.wake_allowed
    }

    /// The PreferredBearer observable
    #[must_use]
    pub fn preferred_bearer(&self) -> PreferredBearer {
        self.prefer_bearer
    }

    /// Whether a store writeback is due
    #[must_use]
    pub fn store_is_pending(&self) -> bool {
        self.store_pending
    }

    /// Service-changed CCC values (LE, BR/EDR)
    #[must_use]
    pub fn svc_chng_ccc(&self) -> (u16, u16) {
        (self.svc_chng_ccc_le, self.svc_chng_ccc_bredr)
    }

    /// Store a service-changed CCC descriptor value
    pub fn set_svc_chng_ccc(&mut self, bearer: BearerType, value: u16) {
        match bearer {
            BearerType::Le => self.svc_chng_ccc_le = value,
            BearerType::BrEdr => self.svc_chng_ccc_bredr = value,
        }
        self.mark_dirty();
    }

    // ---- persistence hooks ---------------------------------------------

    /// Mark learned state dirty; the next tick emits one store command
    pub fn mark_dirty(&mut self) {
        if self.is_storable() {
            self.store_pending = true;
        }
    }

    /// Take the dirty flag, if storing is permitted
    pub fn take_store_pending(&mut self) -> bool {
        if self.store_pending && self.is_storable() {
            self.store_pending = false;
            return true;
        }
        self.store_pending = false;
        false
    }

    // ---- temporary lifecycle -------------------------------------------

    /// Promote or demote the temporary state
    ///
    /// Promotion cancels the expiry timer and triggers initial persistence;
    /// demotion re-arms the timer and removes stored state.
    pub fn set_temporary(
        &mut self,
        temporary: bool,
        now: Instant,
        cfg: &RegistryConfig,
        out: &mut Outbox,
    ) {
        if self.temporary == temporary {
            return;
        }
        self.temporary = temporary;

        if temporary {
            self.temporary_timer = Some(now + cfg.temporary_timeout);
            out.command(Command::RemoveStore {
                addr: self.address,
            });
        } else {
            self.temporary_timer = None;
            self.mark_dirty();
        }
    }

    /// Refresh the expiry timer on a new sighting
    pub fn update_last_seen(&mut self, bearer: BearerType, now: Instant, cfg: &RegistryConfig) {
        let state = self.bearer_state_mut(bearer);
        state.last_seen = Some(now);
        state.connectable = true;

        if self.temporary {
            self.temporary_timer = Some(now + cfg.temporary_timeout);
        }
    }

    /// Check the expiry timer; returns true when the device should be
    /// removed from the registry
    pub fn temporary_expired(&mut self, now: Instant, cfg: &RegistryConfig) -> bool {
        let Some(deadline) = self.temporary_timer else {
            return false;
        };
        if now < deadline {
            return false;
        }

        // Activity from services buys more time
        if self.services.any_busy() {
            self.temporary_timer = Some(now + cfg.temporary_timeout);
            return false;
        }

        self.temporary_timer = None;
        true
    }

    // ---- connection lifecycle ------------------------------------------

    /// Handle a bearer link coming up
    pub fn add_connection(
        &mut self,
        bearer: BearerType,
        initiator: bool,
        now: Instant,
        cfg: &RegistryConfig,
        out: &mut Outbox,
    ) {
        self.update_last_seen(bearer, now, cfg);
        self.update_last_used(bearer, now, out);

        if self.bearer_state(bearer).connected {
            defmt::error!("device already connected on this bearer");
            return;
        }

        self.conn_address = Some((self.address, self.address_type));
        match bearer {
            BearerType::BrEdr => self.set_bredr_support(),
            BearerType::Le => {
                self.set_le_support();
                self.att_connected = true;
            }
        }

        let state = self.bearer_state_mut(bearer);
        state.connected = true;
        state.initiator = initiator;

        // A pending LE connect is satisfied by the link itself
        if let Some(req) = self.connect_req {
            if req.bearer == BearerType::Le && bearer == BearerType::Le {
                out.reply(req.id, Ok(()));
                self.connect_req = None;
            }
        }

        // Second bearer coming up does not re-emit Connected
        if self.bredr_state.connected && self.le_state.connected {
            return;
        }

        self.temporary_timer = None;
        out.changed(Property::Connected);
    }

    /// Handle a bearer link going down
    pub fn remove_connection(
        &mut self,
        bearer: BearerType,
        reason: DisconnectReason,
        now: Instant,
        cfg: &RegistryConfig,
        out: &mut Outbox,
    ) {
        if !self.bearer_state(bearer).connected {
            return;
        }

        {
            let state = self.bearer_state_mut(bearer);
            state.connected = false;
            state.initiator = false;
        }
        if bearer == BearerType::Le {
            self.att_connected = false;
            self.gatt_ready = false;
        }
        self.set_svc_refreshed(false, out);
        self.disconn_timer = None;

        // A caller still waiting on Connect() learns about the failure here
        if let Some(req) = self.connect_req.take() {
            out.reply(req.id, Err(DeviceError::ConnectionAttemptFailed));
        }

        // Paired without bonding does not survive the link: drop the
        // pairing and its stored material on both bearers that qualify.
        let mut paired_updated = false;
        if !self.bredr_state.connected && self.bredr_state.paired && !self.bredr_state.bonded {
            out.command(Command::RemoveBonding {
                addr: self.address,
                addr_type: AddressType::BrEdr,
            });
            self.bredr_state.paired = false;
            paired_updated = true;
        }
        if !self.le_state.connected && self.le_state.paired && !self.le_state.bonded {
            out.command(Command::RemoveBonding {
                addr: self.address,
                addr_type: self.address_type,
            });
            self.le_state.paired = false;
            paired_updated = true;
        }
        if paired_updated && !self.is_paired() {
            out.changed(Property::Paired);
        }

        // Only a full disconnect is observable
        if self.is_connected() {
            return;
        }

        self.update_last_seen(bearer, now, cfg);
        self.cache.clear_eir_uuids();

        out.command(Command::EmitDisconnected {
            addr: self.address,
            reason,
        });
        out.changed(Property::Connected);

        if let Some(id) = self.disconnect_req.take() {
            out.reply(id, Ok(()));
        }

        if self.temporary {
            self.temporary_timer = Some(now + cfg.temporary_timeout);
        }
    }

    fn update_last_used(&mut self, bearer: BearerType, now: Instant, out: &mut Outbox) {
        self.bearer_state_mut(bearer).last_used = Some(now);

        if self.prefer_bearer != PreferredBearer::LastUsed {
            return;
        }

        // Prefer tracks the last used bearer under this policy
        self.bearer_state_mut(bearer).prefer = true;
        match bearer {
            BearerType::BrEdr => {
                if self.le_state.prefer {
                    self.le_state.prefer = false;
                    self.set_auto_connect(false, out);
                }
            }
            BearerType::Le => {
                if self.bredr_state.prefer {
                    self.bredr_state.prefer = false;
                    self.set_auto_connect(true, out);
                }
            }
        }

        self.mark_dirty();
    }

    // ---- auto connect ---------------------------------------------------

    /// Toggle passive-scan auto-connect
    ///
    /// Privacy implies no auto-connect; a BR/EDR preference suppresses it
    /// because BR/EDR does not use the passive scan list.
    pub fn set_auto_connect(&mut self, enable: bool, out: &mut Outbox) {
        if !self.le || self.address.is_private(self.address_type) {
            return;
        }
        if self.auto_connect == enable {
            return;
        }
        self.auto_connect = enable;

        if !enable {
            out.command(Command::RemoveAutoConnect {
                addr: self.address,
            });
            return;
        }

        if self.prefer_bearer == PreferredBearer::BrEdr {
            return;
        }

        out.command(Command::AddAutoConnect {
            addr: self.address,
        });
    }

    // ---- connect --------------------------------------------------------

    /// The connect() operation, optionally restricted to one profile
    ///
    /// # Errors
    ///
    /// `InProgress` with another browse/bonding/connect active, `NotReady`
    /// without adapter power, `ProfileUnavailable` when services resolved
    /// but nothing can connect, bearer-tagged errors otherwise.
    pub fn connect(
        &mut self,
        id: RequestId,
        uuid: Option<ServiceUuid>,
        now: Instant,
        cfg: &RegistryConfig,
        profiles: &ProfileTable,
        adapter_powered: bool,
        adapter_bredr: bool,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        if self.bonding.is_some()
            || self.connect_req.is_some()
            || self.browse.is_some()
            || self.services.has_pending()
        {
            return Err(DeviceError::InProgress);
        }
        if !adapter_powered {
            return Err(DeviceError::NotReady);
        }

        self.set_temporary(false, now, cfg, out);

        let bearer = if uuid.is_some() && self.bredr {
            // Profile connects ride BR/EDR whenever the bearer exists
            BearerType::BrEdr
        } else {
            select_connect_bearer(&self.bearer_view(adapter_bredr), now)
        };

        match bearer {
            BearerType::Le => self.connect_le(id, now, out),
            BearerType::BrEdr => self.connect_bredr(id, uuid, out, profiles),
        }
    }

    fn connect_le(
        &mut self,
        id: RequestId,
        _now: Instant,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        if self.le_state.connected {
            out.reply(id, Ok(()));
            return Ok(());
        }

        if self.disable_auto_connect {
            self.disable_auto_connect = false;
            self.set_auto_connect(true, out);
        }

        out.command(Command::AttConnect {
            addr: self.address,
            addr_type: self.address_type,
        });
        self.connect_req = Some(ConnectRequest {
            id,
            bearer: BearerType::Le,
            uuid: None,
        });
        Ok(())
    }

    fn connect_bredr(
        &mut self,
        id: RequestId,
        uuid: Option<ServiceUuid>,
        out: &mut Outbox,
        profiles: &ProfileTable,
    ) -> Result<(), DeviceError> {
        if !self.bredr_state.svc_resolved {
            let op = match uuid {
                Some(u) => BrowseWaiterOp::ConnectProfile(u),
                None => BrowseWaiterOp::Connect,
            };
            self.start_browse_sdp(Some(BrowseWaiter { id, op }), out);
            return Ok(());
        }

        match self.services.build_pending(profiles, uuid) {
            Ok(()) => {}
            Err(DeviceError::ProfileUnavailable) if uuid.is_none() => {
                // A refreshed device with a live service is already done
                if self.svc_refreshed && self.services.any_in_state(ServiceState::Connected) {
                    out.reply(id, Ok(()));
                    return Ok(());
                }
                return Err(DeviceError::ProfileUnavailable);
            }
            Err(e) => return Err(e),
        }

        self.connect_req = Some(ConnectRequest {
            id,
            bearer: BearerType::BrEdr,
            uuid,
        });
        self.connect_next_service(out);
        Ok(())
    }

    fn connect_next_service(&mut self, out: &mut Outbox) -> bool {
        if let Some(index) = self.services.start_next_pending() {
            if let Some(service) = self.services.get(index) {
                out.command(Command::ConnectService {
                    addr: self.address,
                    uuid: service.uuid,
                });
                return true;
            }
        }
        false
    }

    /// A profile finished its connect attempt
    pub fn service_connected(
        &mut self,
        uuid: ServiceUuid,
        result: Result<(), DeviceError>,
        out: &mut Outbox,
    ) {
        if let Some(index) = self.services.find_by_uuid(uuid) {
            let state = if result.is_ok() {
                ServiceState::Connected
            } else {
                ServiceState::Disconnected
            };
            self.services.set_state(index, state);
        }

        // BR/EDR page timeout with an idle LE bearer: try LE instead of
        // failing the caller
        if result == Err(DeviceError::ConnectionAttemptFailed)
            && self.le
            && !self.le_state.connected
        {
            if let Some(req) = self.connect_req.take() {
                self.services.drop_pending();
                defmt::info!("bredr connect failed, falling back to le");
                out.command(Command::AttConnect {
                    addr: self.address,
                    addr_type: self.address_type,
                });
                self.connect_req = Some(ConnectRequest {
                    id: req.id,
                    bearer: BearerType::Le,
                    uuid: None,
                });
                return;
            }
        }

        if self.connect_next_service(out) {
            return;
        }

        // Queue drained: reply success when anything connected
        if let Some(req) = self.connect_req.take() {
            if self.services.any_in_state(ServiceState::Connected) {
                out.reply(req.id, Ok(()));
            } else {
                out.reply(req.id, result.and(Err(DeviceError::ProfileUnavailable)));
            }
        }
    }

    /// A profile finished its disconnect
    pub fn service_disconnected(&mut self, uuid: ServiceUuid, out: &mut Outbox) {
        if let Some(index) = self.services.find_by_uuid(uuid) {
            self.services.set_state(index, ServiceState::Disconnected);
        }

        // The disconnect path waits for services before forcing bearers
        if self.disconnect_req.is_some() && !self.services.any_busy() {
            self.force_bearer_disconnect(out);
        }
    }

    // ---- disconnect -----------------------------------------------------

    /// The disconnect() operation
    pub fn disconnect(&mut self, id: RequestId, now: Instant, out: &mut Outbox) {
        // An untrusted caller loses passive-scan reconnects
        if self.auto_connect && !self.trusted {
            self.disable_auto_connect = true;
            self.set_auto_connect(false, out);
        }
        self.request_disconnect(Some(id), now, out);
    }

    /// Tear the device down, optionally on behalf of a caller
    pub fn request_disconnect(&mut self, id: Option<RequestId>, now: Instant, out: &mut Outbox) {
        if let Some(bonding) = self.bonding.as_ref() {
            let reply = bonding.id;
            self.cancel_bonding_internal(out);
            if let Some(reply) = reply {
                out.reply(reply, Err(DeviceError::AuthenticationCanceled));
            }
        }

        self.cancel_browse(out);

        if self.att_connected {
            out.command(Command::AttDisconnect {
                addr: self.address,
            });
        }

        out.command(Command::NotifyDisconnectWatch {
            addr: self.address,
            temporary: self.temporary,
        });

        self.services.drop_pending();
        let mut any_service = false;
        for service in self.services.iter() {
            if matches!(service.state, ServiceState::Connected | ServiceState::Connecting) {
                out.command(Command::DisconnectService {
                    addr: self.address,
                    uuid: service.uuid,
                });
                any_service = true;
            }
        }

        if let Some(id) = id {
            if self.disconnect_req.is_none() {
                self.disconnect_req = Some(id);
            } else {
                out.reply(id, Err(DeviceError::InProgress));
            }
        }

        if !self.is_connected() {
            if let Some(id) = self.disconnect_req.take() {
                out.reply(id, Ok(()));
            }
            return;
        }

        if any_service {
            // Grace period for services to wind down
            self.disconn_timer = Some(now + DISCONNECT_GRACE);
        } else {
            self.force_bearer_disconnect(out);
        }
    }

    /// Disconnect exactly one service
    ///
    /// # Errors
    ///
    /// `DoesNotExist` when no service matches the UUID.
    pub fn disconnect_profile(
        &mut self,
        id: RequestId,
        uuid: ServiceUuid,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        let index = self
            .services
            .find_by_uuid(uuid)
            .ok_or(DeviceError::DoesNotExist)?;
        let service = self.services.get(index).ok_or(DeviceError::DoesNotExist)?;

        match service.state {
            ServiceState::Disconnected => {
                out.reply(id, Ok(()));
            }
            _ => {
                self.services.set_state(index, ServiceState::Disconnecting);
                out.command(Command::DisconnectService {
                    addr: self.address,
                    uuid,
                });
                out.reply(id, Ok(()));
            }
        }
        Ok(())
    }

    fn force_bearer_disconnect(&mut self, out: &mut Outbox) {
        self.disconn_timer = None;
        for bearer in [BearerType::BrEdr, BearerType::Le] {
            if self.bearer_state(bearer).connected {
                out.command(Command::DisconnectLink {
                    addr: self.address,
                    bearer,
                });
            }
        }
    }

    /// Expire the disconnect grace timer
    pub fn disconnect_grace_expired(&mut self, now: Instant, out: &mut Outbox) {
        if self.disconn_timer.is_some_and(|t| now >= t) {
            self.force_bearer_disconnect(out);
        }
    }

    // ---- pairing --------------------------------------------------------

    /// The pair() operation
    ///
    /// # Errors
    ///
    /// `InProgress` with bonding or connect active, `AlreadyExists` when
    /// the selected bearer is already bonded.
    pub fn pair(
        &mut self,
        id: RequestId,
        io_cap: IoCapability,
        agent_present: bool,
        now: Instant,
        cfg: &RegistryConfig,
        adapter_bredr: bool,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        self.set_temporary(false, now, cfg, out);

        if self.bonding.is_some() || self.connect_req.is_some() {
            return Err(DeviceError::InProgress);
        }

        let bearer = select_pair_bearer(&self.bearer_view(adapter_bredr), now);

        if self.bearer_state(bearer).bonded {
            return Err(DeviceError::AlreadyExists);
        }

        let mut bonding = BondingRequest::new(Some(id), bearer, io_cap);
        bonding.agent_present = agent_present;
        bonding.start_attempt(now);

        match bearer {
            BearerType::Le => {
                if self.disable_auto_connect {
                    self.disable_auto_connect = false;
                    self.set_auto_connect(true, out);
                }

                // Key exchange rides ATT: get the channel up first, then
                // either elevate security to trigger SMP or fall back to a
                // management-initiated bonding
                if !self.le_state.connected && cfg.le_connect_before_pairing {
                    out.command(Command::AttConnect {
                        addr: self.address,
                        addr_type: self.address_type,
                    });
                } else if self.att_connected {
                    out.command(Command::ElevateSecurity {
                        addr: self.address,
                    });
                } else {
                    out.command(Command::CreateBonding {
                        addr: self.address,
                        addr_type: self.address_type,
                        io_cap,
                    });
                }
            }
            BearerType::BrEdr => {
                out.command(Command::CreateBonding {
                    addr: self.address,
                    addr_type: AddressType::BrEdr,
                    io_cap,
                });
            }
        }

        self.bonding = Some(bonding);
        Ok(())
    }

    /// The `cancel_pairing()` operation
    ///
    /// # Errors
    ///
    /// `DoesNotExist` when nothing is in flight; stored bonding material is
    /// removed instead.
    pub fn cancel_pairing(&mut self, out: &mut Outbox) -> Result<(), DeviceError> {
        if self.bonding.is_none() {
            out.command(Command::RemoveBonding {
                addr: self.address,
                addr_type: self.address_type,
            });
            return Err(DeviceError::DoesNotExist);
        }

        let reply = self.bonding.as_ref().and_then(|b| b.id);
        self.cancel_bonding_internal(out);
        if let Some(id) = reply {
            out.reply(id, Err(DeviceError::AuthenticationCanceled));
        }
        Ok(())
    }

    fn cancel_bonding_internal(&mut self, out: &mut Outbox) {
        if self.bonding.is_none() {
            return;
        }
        defmt::debug!("canceling bonding request");

        if self.authr.is_some() {
            self.cancel_authentication(false, out);
        }
        out.command(Command::CancelBonding {
            addr: self.address,
        });
        self.bonding = None;
    }

    /// A bonding attempt completed at the management layer
    #[allow(clippy::too_many_lines)]
    pub fn bonding_complete(
        &mut self,
        bearer: BearerType,
        status: BondingStatus,
        now: Instant,
        cfg: &RegistryConfig,
        out: &mut Outbox,
    ) {
        defmt::debug!("bonding status {}", status);

        if status != BondingStatus::Success {
            if let Some(bonding) = self.bonding.as_mut() {
                bonding.status = status;
                if status.is_transient() && bonding.attempt_retry(now).is_some() {
                    return;
                }
            }

            self.cancel_authentication(true, out);

            // Back to square one unless something else keeps the device
            if !self.is_connected() && !self.bearer_state(bearer).paired && !self.trusted {
                self.set_temporary(true, now, cfg, out);
            }

            if let Some(bonding) = self.bonding.take() {
                if let Some(id) = bonding.id {
                    out.reply(id, status.to_result());
                }
            }

            // The link is not worth keeping after a failed authentication
            if status == BondingStatus::AuthFailed {
                self.request_disconnect(None, now, out);
            }
            return;
        }

        self.authr = None;

        if let Some(bonding) = self.bonding.as_mut() {
            bonding.stop_timer(now);
        }

        // Honor a user-requested wake setting as soon as we are bonded
        if self.wake_override == WakeOverride::Enabled {
            self.apply_wake_override(out);
        }

        let state = self.bearer_state_mut(bearer);
        if state.paired {
            // Already paired: just answer the caller
            if let Some(bonding) = self.bonding.take() {
                if let Some(id) = bonding.id {
                    out.reply(id, Ok(()));
                }
            }
            return;
        }

        state.bonded = true;
        self.set_paired(bearer, out);
        self.mark_dirty();

        let resolved = self.bearer_state(bearer).svc_resolved;
        if let Some(bonding) = self.bonding.take() {
            if resolved {
                if let Some(id) = bonding.id {
                    out.reply(id, Ok(()));
                }
            } else {
                // We initiated: discover services right away, the reply is
                // parked on the browse
                self.discov_timer = None;
                let waiter = bonding.id.map(|id| BrowseWaiter {
                    id,
                    op: BrowseWaiterOp::Pair,
                });
                match bearer {
                    BearerType::BrEdr => self.start_browse_sdp(waiter, out),
                    BearerType::Le => self.start_browse_gatt(waiter, out),
                }
            }
        } else if !resolved && self.browse.is_none() && self.discov_timer.is_none() && cfg.reverse_discovery
        {
            // Inbound pairing: defer discovery briefly to dodge the peer
            // doing its own SDP against us at the same instant
            self.discov_timer = Some(now + DISCOVERY_DEFER);
        }
    }

    /// Set the paired flag on a bearer, emitting at the right moment
    pub fn set_paired(&mut self, bearer: BearerType, out: &mut Outbox) {
        let other_paired = self.bearer_state(match bearer {
            BearerType::BrEdr => BearerType::Le,
            BearerType::Le => BearerType::BrEdr,
        })
        .paired;

        let state = self.bearer_state_mut(bearer);
        if state.paired {
            return;
        }
        state.paired = true;

        // The observable only rises on the first bearer
        if other_paired {
            return;
        }

        if !self.bearer_state(bearer).svc_resolved {
            // Defer the signal until discovery completes
            self.pending_paired = true;
            return;
        }

        out.changed(Property::Paired);
    }

    /// Clear the paired flag on a bearer
    pub fn set_unpaired(&mut self, bearer: BearerType, out: &mut Outbox) {
        let state = self.bearer_state_mut(bearer);
        if !state.paired {
            return;
        }
        state.paired = false;
        state.bonded = false;

        if !self.is_paired() {
            out.changed(Property::Paired);
        }
        self.mark_dirty();
    }

    /// Record a bearer bonded, e.g. from loaded storage or key delivery
    pub fn set_bonded(&mut self, bearer: BearerType, out: &mut Outbox) {
        let state = self.bearer_state_mut(bearer);
        if !state.bonded {
            state.bonded = true;
            out.changed(Property::Bonded);
        }
        self.set_paired(bearer, out);
    }

    // ---- authentication ------------------------------------------------

    /// PIN code request from the management layer
    ///
    /// # Errors
    ///
    /// `InProgress` when a prompt is already pending, `NotReady` without an
    /// agent.
    pub fn request_pincode(&mut self, secure: bool, out: &mut Outbox) -> Result<(), DeviceError> {
        let auth = self.new_auth(AuthKind::PinCode { secure }, AddressType::BrEdr)?;
        self.authr = Some(auth);
        out.command(Command::AgentRequestPinCode {
            addr: self.address,
            secure,
        });
        Ok(())
    }

    /// Passkey request from the management layer
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_pincode`].
    pub fn request_passkey(&mut self, addr_type: AddressType, out: &mut Outbox) -> Result<(), DeviceError> {
        let auth = self.new_auth(AuthKind::Passkey, addr_type)?;
        self.authr = Some(auth);
        out.command(Command::AgentRequestPasskey {
            addr: self.address,
        });
        Ok(())
    }

    /// Numeric comparison request from the management layer
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_pincode`] for the agent paths.
    pub fn confirm_request(
        &mut self,
        addr_type: AddressType,
        passkey: u32,
        confirm_hint: bool,
        cfg: &RegistryConfig,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        let already_paired = self.bearer_state(BearerType::natural(addr_type)).paired;

        match confirm_action(
            confirm_hint,
            already_paired,
            self.bonding.is_some(),
            cfg.jw_repairing,
        ) {
            ConfirmAction::AutoAccept => {
                out.command(Command::ConfirmReply {
                    addr: self.address,
                    addr_type,
                    accept: true,
                });
                Ok(())
            }
            ConfirmAction::AutoReject => {
                out.command(Command::ConfirmReply {
                    addr: self.address,
                    addr_type,
                    accept: false,
                });
                Ok(())
            }
            ConfirmAction::RequestAuthorization => {
                let mut auth = self.new_auth(AuthKind::Confirm, addr_type)?;
                auth.passkey = Some(passkey);
                self.authr = Some(auth);
                out.command(Command::AgentRequestAuthorization {
                    addr: self.address,
                });
                Ok(())
            }
            ConfirmAction::RequestConfirmation => {
                let mut auth = self.new_auth(AuthKind::Confirm, addr_type)?;
                auth.passkey = Some(passkey);
                self.authr = Some(auth);
                out.command(Command::AgentRequestConfirmation {
                    addr: self.address,
                    passkey,
                });
                Ok(())
            }
        }
    }

    /// Display-passkey notification from the management layer
    ///
    /// # Errors
    ///
    /// `Unsupported` when a different prompt kind is pending.
    pub fn notify_passkey(
        &mut self,
        addr_type: AddressType,
        passkey: u32,
        entered: u8,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        match self.authr.as_mut() {
            Some(auth) if auth.kind == AuthKind::NotifyPasskey => {
                auth.passkey = Some(passkey);
            }
            Some(_) => return Err(DeviceError::Unsupported),
            None => {
                let mut auth = self.new_auth(AuthKind::NotifyPasskey, addr_type)?;
                auth.passkey = Some(passkey);
                self.authr = Some(auth);
            }
        }
        out.command(Command::AgentDisplayPasskey {
            addr: self.address,
            passkey,
            entered,
        });
        Ok(())
    }

    /// Display-PIN notification from the management layer
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_pincode`].
    pub fn notify_pincode(
        &mut self,
        secure: bool,
        pincode: &str,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        let mut auth = self.new_auth(AuthKind::NotifyPincode { secure }, AddressType::BrEdr)?;
        let mut pin = heapless::String::new();
        pin.push_str(pincode).map_err(|()| DeviceError::InvalidArguments)?;
        auth.pincode = Some(pin);
        self.authr = Some(auth);

        out.command(Command::AgentDisplayPinCode {
            addr: self.address,
            pin: {
                let mut s = heapless::String::new();
                s.push_str(pincode).ok();
                s
            },
        });
        Ok(())
    }

    fn new_auth(
        &mut self,
        kind: AuthKind,
        addr_type: AddressType,
    ) -> Result<AuthenticationRequest, DeviceError> {
        if self.authr.is_some() {
            return Err(DeviceError::InProgress);
        }
        let agent_present = self.bonding.as_ref().is_none_or(|b| b.agent_present);
        if !agent_present {
            return Err(DeviceError::NotReady);
        }
        Ok(AuthenticationRequest::new(kind, addr_type))
    }

    /// The agent answered a prompt
    pub fn agent_reply(&mut self, reply: crate::AgentReply, out: &mut Outbox) {
        let Some(auth) = self.authr.take() else {
            return;
        };

        match (auth.kind, reply) {
            (AuthKind::PinCode { .. }, crate::AgentReply::PinCode(pin)) => {
                out.command(Command::PinCodeReply {
                    addr: self.address,
                    pin,
                });
            }
            (AuthKind::Passkey, crate::AgentReply::Passkey(passkey)) => {
                out.command(Command::PasskeyReply {
                    addr: self.address,
                    addr_type: auth.addr_type,
                    passkey,
                });
            }
            (AuthKind::Confirm, crate::AgentReply::Confirm(accept)) => {
                out.command(Command::ConfirmReply {
                    addr: self.address,
                    addr_type: auth.addr_type,
                    accept,
                });
            }
            (AuthKind::NotifyPincode { .. } | AuthKind::NotifyPasskey, _) => {}
            _ => {
                defmt::warn!("agent reply does not match pending prompt");
                self.authr = Some(auth);
            }
        }
    }

    /// Cancel the in-flight credential prompt
    ///
    /// Idempotent: cancels the agent and, unless aborted by the management
    /// layer itself, synthesizes the negative reply request-type prompts
    /// still owe.
    pub fn cancel_authentication(&mut self, aborted: bool, out: &mut Outbox) {
        let Some(auth) = self.authr.take() else {
            return;
        };
        defmt::debug!("canceling authentication request");

        out.command(Command::AgentCancel {
            addr: self.address,
        });

        if aborted || !auth.kind.needs_reply() {
            return;
        }

        match auth.kind {
            AuthKind::PinCode { .. } | AuthKind::NotifyPincode { .. } => {
                out.command(Command::PinCodeReply {
                    addr: self.address,
                    pin: None,
                });
            }
            AuthKind::Passkey => {
                out.command(Command::PasskeyReply {
                    addr: self.address,
                    addr_type: auth.addr_type,
                    passkey: None,
                });
            }
            AuthKind::Confirm => {
                out.command(Command::ConfirmReply {
                    addr: self.address,
                    addr_type: auth.addr_type,
                    accept: false,
                });
            }
            AuthKind::NotifyPasskey => {}
        }
    }

    // ---- browse ---------------------------------------------------------

    /// Start an SDP browse, the one discovery slot permitting
    pub fn start_browse_sdp(&mut self, waiter: Option<BrowseWaiter>, out: &mut Outbox) {
        if self.browse.is_some() {
            if let Some(w) = waiter {
                out.reply(w.id, Err(DeviceError::InProgress));
            }
            return;
        }

        let mut req = BrowseRequest::sdp(waiter);
        if let Some(target) = req.next_sdp_target() {
            out.command(Command::SdpSearch {
                addr: self.address,
                uuid: target,
            });
        }
        self.browse = Some(req);
    }

    /// Start a GATT browse, reusing a ready client when possible
    pub fn start_browse_gatt(&mut self, waiter: Option<BrowseWaiter>, out: &mut Outbox) {
        if self.browse.is_some() {
            if let Some(w) = waiter {
                out.reply(w.id, Err(DeviceError::InProgress));
            }
            return;
        }

        self.browse = Some(BrowseRequest::gatt(waiter));
        if self.att_connected {
            // A ready client answers directly; a constructing one delivers
            // the same GattReady event once it settles
            out.command(Command::GattDiscover {
                addr: self.address,
            });
        } else {
            out.command(Command::AttConnect {
                addr: self.address,
                addr_type: self.address_type,
            });
        }
    }

    /// One SDP search finished
    pub fn sdp_result(
        &mut self,
        result: Result<SdpBatch, DeviceError>,
        profiles: &ProfileTable,
        is_uuid_allowed: impl Fn(ServiceUuid) -> bool,
        out: &mut Outbox,
    ) {
        let Some(browse) = self.browse.as_mut() else {
            return;
        };
        if browse.kind != BrowseKind::Sdp {
            return;
        }

        match result {
            Ok(batch) => {
                browse.record_sdp_batch(&batch);
                if let Some(target) = browse.next_sdp_target() {
                    out.command(Command::SdpSearch {
                        addr: self.address,
                        uuid: target,
                    });
                    return;
                }
                self.finish_browse(Ok(()), BearerType::BrEdr, profiles, is_uuid_allowed, out);
            }
            Err(err) => {
                self.finish_browse(Err(err), BearerType::BrEdr, profiles, is_uuid_allowed, out);
            }
        }
    }

    /// The GATT client became ready and delivered the primary services
    pub fn gatt_ready(
        &mut self,
        primaries: &[GattPrimary],
        profiles: &ProfileTable,
        is_uuid_allowed: impl Fn(ServiceUuid) -> bool,
        out: &mut Outbox,
    ) {
        self.gatt_ready = true;

        if let Some(browse) = self.browse.as_mut() {
            if browse.kind == BrowseKind::Gatt {
                browse.record_gatt_primaries(primaries);
                self.finish_browse(Ok(()), BearerType::Le, profiles, is_uuid_allowed, out);
                return;
            }
        }

        // Unsolicited readiness still refreshes the primaries
        self.merge_outcome(
            &BrowseOutcome {
                uuids: primaries.iter().map(|p| p.uuid).collect(),
                primaries: primaries.iter().copied().collect(),
                device_id: None,
            },
            profiles,
            out,
        );
    }

    /// Cancel any in-flight browse; waiters see `Canceled`
    pub fn cancel_browse(&mut self, out: &mut Outbox) {
        let Some(browse) = self.browse.as_mut() else {
            return;
        };
        browse.cancel();

        if browse.kind == BrowseKind::Sdp {
            out.command(Command::SdpCancel {
                addr: self.address,
            });
        }

        if let Some(waiter) = browse.waiter {
            out.reply(waiter.id, Err(DeviceError::Canceled));
        }
        self.browse = None;
    }

    fn finish_browse(
        &mut self,
        result: Result<(), DeviceError>,
        bearer: BearerType,
        profiles: &ProfileTable,
        is_uuid_allowed: impl Fn(ServiceUuid) -> bool,
        out: &mut Outbox,
    ) {
        let Some(browse) = self.browse.take() else {
            return;
        };
        let waiter = browse.waiter;
        let outcome = browse.into_outcome();

        if let Err(err) = result {
            // Pairing callers get their verdict from the bond, not from
            // discovery
            if let Some(waiter) = waiter {
                if waiter.op == BrowseWaiterOp::Pair {
                    out.reply(waiter.id, Ok(()));
                    self.flush_pending_paired(out);
                    return;
                }
            }

            // BR/EDR host unreachable: a silent LE fallback beats failing
            // the caller
            if err == DeviceError::ConnectionAttemptFailed
                && bearer == BearerType::BrEdr
                && self.le
                && !self.le_state.connected
            {
                if let Some(waiter) = waiter {
                    out.command(Command::AttConnect {
                        addr: self.address,
                        addr_type: self.address_type,
                    });
                    self.connect_req = Some(ConnectRequest {
                        id: waiter.id,
                        bearer: BearerType::Le,
                        uuid: None,
                    });
                    return;
                }
            }

            if let Some(waiter) = waiter {
                out.reply(waiter.id, Err(err));
            }
            self.flush_pending_paired(out);
            return;
        }

        self.merge_outcome(&outcome, profiles, out);
        self.svc_resolved(bearer, waiter, profiles, is_uuid_allowed, out);
    }

    fn merge_outcome(&mut self, outcome: &BrowseOutcome, profiles: &ProfileTable, out: &mut Outbox) {
        let mut uuids_changed = false;
        for uuid in &outcome.uuids {
            if !self.uuids.contains(uuid) && self.uuids.push(*uuid).is_ok() {
                uuids_changed = true;
            }
        }
        for primary in &outcome.primaries {
            if !self.primaries.contains(primary) {
                self.primaries.push(*primary).ok();
            }
        }
        if let Some(device_id) = outcome.device_id {
            if self.cache.device_id != Some(device_id) {
                self.cache.device_id = Some(device_id);
                out.changed(Property::Modalias);
            }
        }

        if uuids_changed {
            out.changed(Property::Uuids);
            self.probe_profiles(profiles);
        }
        if uuids_changed || outcome.device_id.is_some() {
            self.mark_dirty();
        }
    }

    /// Whether an attribute handle belongs to a service claimed by an
    /// internal profile
    ///
    /// Internally handled primaries are off limits for external GATT
    /// handlers; everything else may be exported.
    #[must_use]
    pub fn gatt_range_claimed(&self, profiles: &ProfileTable, handle: u16) -> bool {
        self.primaries.iter().any(|primary| {
            if handle < primary.start_handle || handle > primary.end_handle {
                return false;
            }
            self.services
                .find_by_uuid(primary.uuid)
                .and_then(|index| self.services.get(index))
                .and_then(|service| profiles.get(service.profile))
                .is_some_and(|profile| !profile.external)
        })
    }

    /// Attach services for every resolved UUID with a registered profile
    pub fn probe_profiles(&mut self, profiles: &ProfileTable) {
        for i in 0..self.uuids.len() {
            let uuid = self.uuids[i];
            if let Some(profile_id) = profiles.find_by_uuid(uuid) {
                self.services.attach(profiles, profile_id);
                if profiles.get(profile_id).is_some_and(|p| p.wake_support) && !self.wake_support {
                    self.wake_support = true;
                    self.supported_flags |= DEVICE_FLAG_REMOTE_WAKEUP;
                }
            }
        }
    }

    /// Discovery finished on a bearer
    fn svc_resolved(
        &mut self,
        bearer: BearerType,
        waiter: Option<BrowseWaiter>,
        profiles: &ProfileTable,
        is_uuid_allowed: impl Fn(ServiceUuid) -> bool,
        out: &mut Outbox,
    ) {
        self.bearer_state_mut(bearer).svc_resolved = true;

        // A disconnect may already have raced us; only a live link counts
        if self.bearer_state(bearer).connected {
            self.set_svc_refreshed(true, out);
        }

        self.cache.clear_eir_uuids();
        self.flush_pending_paired(out);
        self.mark_dirty();

        self.services.update_allowed(is_uuid_allowed);

        // Walk the parked caller
        if let Some(waiter) = waiter {
            match waiter.op {
                BrowseWaiterOp::Discover | BrowseWaiterOp::Pair => {
                    out.reply(waiter.id, Ok(()));
                }
                BrowseWaiterOp::Connect => {
                    let result = self.connect_bredr(waiter.id, None, out, profiles);
                    if let Err(err) = result {
                        out.reply(waiter.id, Err(err));
                    }
                }
                BrowseWaiterOp::ConnectProfile(uuid) => {
                    let result = self.connect_bredr(waiter.id, Some(uuid), out, profiles);
                    if let Err(err) = result {
                        out.reply(waiter.id, Err(err));
                    }
                }
            }
        }
    }

    fn flush_pending_paired(&mut self, out: &mut Outbox) {
        if self.pending_paired {
            out.changed(Property::Paired);
            self.pending_paired = false;
            self.mark_dirty();
        }
    }

    fn set_svc_refreshed(&mut self, value: bool, out: &mut Outbox) {
        if self.svc_refreshed == value {
            return;
        }
        self.svc_refreshed = value;
        out.changed(Property::ServicesResolved);
    }

    /// Expire the reverse-discovery deferral timer
    pub fn discovery_timer_expired(&mut self, now: Instant, out: &mut Outbox) {
        if self.discov_timer.is_some_and(|t| now >= t) {
            self.discov_timer = None;
            if self.browse.is_none() {
                match select_connect_bearer(&self.bearer_view(true), now) {
                    BearerType::BrEdr => self.start_browse_sdp(None, out),
                    BearerType::Le => self.start_browse_gatt(None, out),
                }
            }
        }
    }

    /// Replace the primaries snapshot after a GATT database refresh
    ///
    /// A successful refresh keeps the new snapshot; a failed one keeps the
    /// original.
    pub fn apply_gatt_refresh(&mut self, new_primaries: &[GattPrimary], success: bool) {
        if !success {
            return;
        }
        self.primaries.clear();
        for primary in new_primaries {
            self.primaries.push(*primary).ok();
        }
        self.mark_dirty();
    }

    // ---- policy setters -------------------------------------------------

    /// Set the Trusted property
    pub fn set_trusted(&mut self, trusted: bool, now: Instant, cfg: &RegistryConfig, out: &mut Outbox) {
        if self.trusted == trusted {
            return;
        }
        if trusted {
            self.set_temporary(false, now, cfg, out);
        }
        self.trusted = trusted;
        self.mark_dirty();
        out.changed(Property::Trusted);
    }

    /// Set the Alias property
    pub fn set_alias(&mut self, alias: &str, out: &mut Outbox) {
        if self.cache.set_alias(alias) {
            self.mark_dirty();
            out.changed(Property::Alias);
        }
    }

    /// Set the Blocked property
    ///
    /// # Errors
    ///
    /// Propagates nothing today; kept fallible for kernels without a block
    /// list.
    pub fn set_blocked(
        &mut self,
        blocked: bool,
        now: Instant,
        cfg: &RegistryConfig,
        profiles: &ProfileTable,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        if self.blocked == blocked {
            return Ok(());
        }

        if blocked {
            self.blocked = true;
            // Stop everything and keep the device registered
            self.request_disconnect(None, now, out);
            self.services.clear();
            out.command(Command::BlockLink {
                addr: self.address,
                addr_type: self.address_type,
            });
            self.set_temporary(false, now, cfg, out);
        } else {
            self.blocked = false;
            out.command(Command::UnblockLink {
                addr: self.address,
                addr_type: self.address_type,
            });
            // Re-probe from the resolved UUID set; nothing connects by
            // itself
            self.probe_profiles(profiles);
        }

        self.mark_dirty();
        out.changed(Property::Blocked);
        Ok(())
    }

    /// Set the CablePairing flag
    pub fn set_cable_pairing(&mut self, cable_pairing: bool, out: &mut Outbox) {
        if self.cable_pairing == cable_pairing {
            return;
        }
        self.cable_pairing = cable_pairing;
        self.mark_dirty();
        out.changed(Property::CablePairing);
    }

    /// Set the LegacyPairing flag derived from pre-SSP authentication
    pub fn set_legacy_pairing(&mut self, legacy: bool, out: &mut Outbox) {
        if self.legacy_pairing == legacy {
            return;
        }
        self.legacy_pairing = legacy;
        out.changed(Property::LegacyPairing);
    }

    /// Set the PreferredBearer property
    ///
    /// # Errors
    ///
    /// `NotSupported` for single-bearer devices.
    pub fn set_preferred_bearer(
        &mut self,
        prefer: PreferredBearer,
        out: &mut Outbox,
    ) -> Result<(), DeviceError> {
        if !(self.bredr && self.le) {
            return Err(DeviceError::NotSupported);
        }
        if self.prefer_bearer == prefer {
            return Ok(());
        }
        self.prefer_bearer = prefer;

        match prefer {
            PreferredBearer::Le => {
                self.le_state.prefer = true;
                self.bredr_state.prefer = false;
                self.set_auto_connect(true, out);
            }
            PreferredBearer::BrEdr => {
                self.bredr_state.prefer = true;
                self.le_state.prefer = false;
                // BR/EDR does not use the passive scan list
                self.set_auto_connect(false, out);
            }
            PreferredBearer::LastUsed => {
                let use_le = match (self.le_state.last_used, self.bredr_state.last_used) {
                    (Some(le), Some(bredr)) => le >= bredr,
                    (Some(_), None) => true,
                    _ => false,
                };
                self.le_state.prefer = use_le;
                self.bredr_state.prefer = !use_le;
            }
            PreferredBearer::LastSeen => {
                self.le_state.prefer = false;
                self.bredr_state.prefer = false;
            }
        }

        self.mark_dirty();
        out.changed(Property::PreferredBearer);
        Ok(())
    }

    // ---- wake management ------------------------------------------------

    /// Record profile-driven wake support
    pub fn set_wake_support(&mut self, support: bool, out: &mut Outbox) {
        self.wake_support = support;
        if support {
            self.supported_flags |= DEVICE_FLAG_REMOTE_WAKEUP;
        }

        // Wake up by default for bonded wake-capable devices
        if support && self.wake_override == WakeOverride::Default && self.is_bonded() {
            self.wake_override = WakeOverride::Enabled;
            self.apply_wake_override(out);
        }
    }

    /// Set the WakeAllowed property
    ///
    /// # Errors
    ///
    /// `Unsupported` while temporary or without profile wake support,
    /// `InProgress` while a flags update is pending.
    pub fn set_wake_allowed(&mut self, allowed: bool, out: &mut Outbox) -> Result<(), DeviceError> {
        if self.temporary || self.supported_flags & DEVICE_FLAG_REMOTE_WAKEUP == 0 {
            return Err(DeviceError::Unsupported);
        }

        self.wake_override = if allowed {
            WakeOverride::Enabled
        } else {
            WakeOverride::Disabled
        };

        if self.pending_wake_allowed == Some(allowed) {
            return Err(DeviceError::InProgress);
        }
        if self.wake_allowed == allowed {
            return Ok(());
        }

        self.apply_wake_override(out);
        Ok(())
    }

    /// Push the wake override down to the kernel flags; idempotent
    pub fn apply_wake_override(&mut self, out: &mut Outbox) {
        let desired = match self.wake_override {
            WakeOverride::Enabled => true,
            WakeOverride::Disabled => false,
            WakeOverride::Default => return,
        };
        if self.wake_allowed == desired || self.pending_wake_allowed == Some(desired) {
            return;
        }

        self.pending_wake_allowed = Some(desired);
        let mut flags = self.current_flags;
        if desired {
            flags |= DEVICE_FLAG_REMOTE_WAKEUP;
        } else {
            flags &= !DEVICE_FLAG_REMOTE_WAKEUP;
        }
        self.pending_flags = flags;
        out.command(Command::SetDeviceFlags {
            addr: self.address,
            flags,
        });
    }

    /// Kernel device flags changed
    pub fn flags_changed(&mut self, supported: u32, current: u32, out: &mut Outbox) {
        self.supported_flags = supported;
        self.current_flags = current;
        self.pending_flags = 0;
        self.pending_wake_allowed = None;

        let wake = current & DEVICE_FLAG_REMOTE_WAKEUP != 0;
        if self.wake_allowed != wake {
            self.wake_allowed = wake;
            self.mark_dirty();
            out.changed(Property::WakeAllowed);
        }

        // Apply a still-unsatisfied override; harmless when settled
        self.apply_wake_override(out);
    }

    // ---- key material ---------------------------------------------------

    /// Install the long-term key delivered by the management layer
    pub fn set_ltk(&mut self, key: [u8; 16], central: bool, enc_size: u8, out: &mut Outbox) {
        let unlocked = self.keys.set_ltk(key, central, enc_size);
        for index in unlocked {
            self.keys.mark_sirk_in_set(index);
            out.changed(Property::Sets);
        }
        self.mark_dirty();
    }

    /// Install a signature key delivered by the management layer
    pub fn set_csrk(
        &mut self,
        kind: CsrkKind,
        key: [u8; 16],
        counter: u32,
        store_hint: bool,
        now: Instant,
        cfg: &RegistryConfig,
        out: &mut Outbox,
    ) {
        self.keys.set_csrk(kind, key, counter);

        if store_hint {
            self.set_temporary(false, now, cfg, out);
            self.mark_dirty();
        }
    }

    /// Add a set identity resolving key
    ///
    /// Encrypted keys only join a device set once an LTK is available.
    pub fn add_sirk(
        &mut self,
        key: [u8; 16],
        encrypted: bool,
        size: u8,
        rank: u8,
        out: &mut Outbox,
    ) -> bool {
        if encrypted && self.keys.ltk.is_none() {
            // Remember the key; it unlocks when the LTK arrives
            self.keys.add_sirk(key, encrypted, size, rank);
            self.mark_dirty();
            return false;
        }

        let (index, _added) = self.keys.add_sirk(key, encrypted, size, rank);
        if self.keys.sirk_usable(index) {
            self.keys.mark_sirk_in_set(index);
            out.changed(Property::Sets);
        }
        self.mark_dirty();
        true
    }

    /// Validate an inbound signed write against the stored counter
    ///
    /// # Errors
    ///
    /// See [`KeyStore::accept_remote_sign_counter`].
    pub fn signed_write_received(&mut self, counter: u32) -> Result<(), DeviceError> {
        let result = self.keys.accept_remote_sign_counter(counter);
        if result.is_ok() {
            self.mark_dirty();
        }
        result
    }

    // ---- name resolution -------------------------------------------------

    /// Record a failed remote-name request
    pub fn name_resolve_failed(&mut self, now: Instant) {
        self.name_resolve_failed = Some(now);
        self.mark_dirty();
    }

    /// Whether a new remote-name request is allowed yet
    #[must_use]
    pub fn is_name_resolve_allowed(&self, now: Instant, cfg: &RegistryConfig) -> bool {
        match self.name_resolve_failed {
            None => true,
            Some(failed) => now.saturating_duration_since(failed) >= cfg.name_resolve_retry_delay,
        }
    }

    /// Last failed name-resolution attempt
    #[must_use]
    pub fn name_resolve_failed_at(&self) -> Option<Instant> {
        self.name_resolve_failed
    }

    // ---- timers ---------------------------------------------------------

    /// Walk every timer slot; called from the registry tick
    pub fn poll_timers(&mut self, now: Instant, out: &mut Outbox) {
        self.disconnect_grace_expired(now, out);
        self.discovery_timer_expired(now, out);

        if let Some(bonding) = self.bonding.as_mut() {
            if bonding.take_due_retry(now) {
                defmt::debug!("retrying bonding");
                bonding.restart_timer(now);
                let io_cap = bonding.io_cap;
                let addr_type = match bonding.bearer {
                    BearerType::BrEdr => AddressType::BrEdr,
                    BearerType::Le => self.address_type,
                };
                out.command(Command::CreateBonding {
                    addr: self.address,
                    addr_type,
                    io_cap,
                });
            }
        }
    }

    // ---- state restoration ----------------------------------------------

    /// Restore raw bearer state, used by storage loading
    pub(crate) fn restore_bearer_state(&mut self, bearer: BearerType, state: BearerState) {
        *self.bearer_state_mut(bearer) = state;
    }

    /// Restore the preferred bearer from storage without emission
    pub(crate) fn restore_preferred_bearer(&mut self, prefer: PreferredBearer) {
        self.prefer_bearer = prefer;
    }

    /// Restore policy flags from storage without emission
    pub(crate) fn restore_policy(&mut self, trusted: bool, blocked: bool, cable_pairing: bool, wake_allowed: bool) {
        self.trusted = trusted;
        self.blocked = blocked;
        self.cable_pairing = cable_pairing;
        self.wake_allowed = wake_allowed;
        self.temporary = false;
        self.temporary_timer = None;
    }

    /// Restore resolved UUIDs and primaries from storage
    pub(crate) fn restore_services(
        &mut self,
        uuids: &[ServiceUuid],
        primaries: &[GattPrimary],
        profiles: &ProfileTable,
    ) {
        for uuid in uuids {
            if !self.uuids.contains(uuid) {
                self.uuids.push(*uuid).ok();
            }
        }
        for primary in primaries {
            if !self.primaries.contains(primary) {
                self.primaries.push(*primary).ok();
            }
        }
        self.probe_profiles(profiles);
    }

    /// Restore the bearer-presence flags from storage
    pub(crate) fn restore_bearers(&mut self, bredr: bool, le: bool) {
        self.bredr = bredr || self.bredr;
        self.le = le || self.le;
    }

    /// Restore the service-changed CCC values from storage
    pub(crate) fn restore_svc_chng_ccc(&mut self, ccc_le: u16, ccc_bredr: u16) {
        self.svc_chng_ccc_le = ccc_le;
        self.svc_chng_ccc_bredr = ccc_bredr;
    }

    /// Restore the cached name-resolution failure timestamp
    pub(crate) fn restore_name_resolve_failed(&mut self, at: Option<Instant>) {
        self.name_resolve_failed = at;
    }
}
