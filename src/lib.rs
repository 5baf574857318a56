#![no_std]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![allow(clippy::large_enum_variant)]

pub mod address;
pub mod api;
pub mod bearer;
pub mod bonding;
pub mod browse;
pub mod cache;
pub mod class_of_device;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod keys;
pub mod registry;
pub mod service;
pub mod store;
pub mod uuid;

mod processor;

pub use address::{AddressType, DeviceAddress};
pub use bearer::{BearerState, BearerType, BearerView, PreferredBearer};
pub use class_of_device::ClassOfDevice;
pub use config::RegistryConfig;
pub use device::Device;
pub use error::{BondingStatus, DeviceError, DisconnectReason};
pub use processor::{handle_event, request_processor, tick};
pub use registry::{DeviceRegistry, DeviceSnapshot};

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel, mutex::Mutex};
use heapless::{String, Vec};

use crate::{
    bonding::IoCapability,
    browse::{GattPrimary, SdpBatch},
    constants::{
        MAX_CHANNELS, MAX_COMMANDS, MAX_DATA_LEN, MAX_DATA_RECORDS, MAX_EIR_UUIDS,
        MAX_NAME_LENGTH, MAX_PIN_LENGTH, MAX_PRIMARIES, MAX_PROPERTY_CHANGES,
    },
    uuid::ServiceUuid,
};

/// API requests travel here; the request processor drains it
pub(crate) static REQUEST_CHANNEL: Channel<CriticalSectionRawMutex, Request, MAX_CHANNELS> =
    Channel::new();

/// API responses, matched to requests by id
pub(crate) static RESPONSE_CHANNEL: Channel<CriticalSectionRawMutex, Response, MAX_CHANNELS> =
    Channel::new();

/// Outbound commands for the embedding stack (adapter, agent, storage glue)
pub static COMMAND_CHANNEL: Channel<CriticalSectionRawMutex, Command, MAX_COMMANDS> =
    Channel::new();

pub(crate) static DEVICE_REGISTRY: Mutex<CriticalSectionRawMutex, Option<DeviceRegistry>> =
    Mutex::new(None);

/// Install the registry; must run before any event or request is processed
pub async fn init_registry(config: RegistryConfig) {
    let mut guard = DEVICE_REGISTRY.lock().await;
    *guard = Some(DeviceRegistry::new(config));
}

/// Run a closure against the registry
///
/// # Errors
///
/// Returns [`DeviceError::NotReady`] before [`init_registry`] ran.
pub async fn with_registry<R>(
    f: impl FnOnce(&mut DeviceRegistry) -> R,
) -> Result<R, DeviceError> {
    let mut guard = DEVICE_REGISTRY.lock().await;
    match guard.as_mut() {
        Some(registry) => Ok(f(registry)),
        None => Err(DeviceError::NotReady),
    }
}

/// Token correlating a request with its (possibly deferred) response
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct RequestId(pub u32);

/// Observable properties of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum Property {
    /// Identity address
    Address,
    /// Identity address type
    AddressType,
    /// Remote device name
    Name,
    /// Locally assigned alias
    Alias,
    /// Class of device
    Class,
    /// LE appearance
    Appearance,
    /// Derived icon name
    Icon,
    /// Keys exchanged on either bearer
    Paired,
    /// Keys stored for either bearer
    Bonded,
    /// Trusted flag
    Trusted,
    /// Blocked flag
    Blocked,
    /// Pre-SSP pairing detected
    LegacyPairing,
    /// Out-of-band cable pairing
    CablePairing,
    /// Signal strength
    Rssi,
    /// Either bearer connected
    Connected,
    /// Resolved or EIR-observed UUIDs
    Uuids,
    /// Device-ID modalias
    Modalias,
    /// Owning adapter
    Adapter,
    /// Manufacturer specific data
    ManufacturerData,
    /// Service data
    ServiceData,
    /// Advertised TX power
    TxPower,
    /// Discovery completed while connected
    ServicesResolved,
    /// Advertising flags
    AdvertisingFlags,
    /// Raw advertising data
    AdvertisingData,
    /// Remote wakeup granted
    WakeAllowed,
    /// Coordinated set membership
    Sets,
    /// Preferred bearer policy
    PreferredBearer,
}

impl Property {
    /// The stable property name observers key change notifications by
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Address => "Address",
            Self::AddressType => "AddressType",
            Self::Name => "Name",
            Self::Alias => "Alias",
            Self::Class => "Class",
            Self::Appearance => "Appearance",
            Self::Icon => "Icon",
            Self::Paired => "Paired",
            Self::Bonded => "Bonded",
            Self::Trusted => "Trusted",
            Self::Blocked => "Blocked",
            Self::LegacyPairing => "LegacyPairing",
            Self::CablePairing => "CablePairing",
            Self::Rssi => "RSSI",
            Self::Connected => "Connected",
            Self::Uuids => "UUIDs",
            Self::Modalias => "Modalias",
            Self::Adapter => "Adapter",
            Self::ManufacturerData => "ManufacturerData",
            Self::ServiceData => "ServiceData",
            Self::TxPower => "TxPower",
            Self::ServicesResolved => "ServicesResolved",
            Self::AdvertisingFlags => "AdvertisingFlags",
            Self::AdvertisingData => "AdvertisingData",
            Self::WakeAllowed => "WakeAllowed",
            Self::Sets => "Sets",
            Self::PreferredBearer => "PreferredBearer",
        }
    }
}

/// A reply produced by the user agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    /// PIN entry result; `None` means rejected/canceled
    PinCode(Option<String<MAX_PIN_LENGTH>>),
    /// Passkey entry result; `None` means rejected/canceled
    Passkey(Option<u32>),
    /// Numeric comparison verdict
    Confirm(bool),
}

/// Outbound calls the state machine asks its collaborators to perform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // -- management / adapter --
    /// Start bonding at the management layer
    CreateBonding {
        /// Peer address
        addr: DeviceAddress,
        /// Address type for the bonding
        addr_type: AddressType,
        /// IO capability to announce
        io_cap: IoCapability,
    },
    /// Abort the in-flight bonding
    CancelBonding {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Remove stored bonding material
    RemoveBonding {
        /// Peer address
        addr: DeviceAddress,
        /// Address type whose keys go away
        addr_type: AddressType,
    },
    /// Force a bearer link down
    DisconnectLink {
        /// Peer address
        addr: DeviceAddress,
        /// Bearer to disconnect
        bearer: BearerType,
    },
    /// Reject the peer at the controller
    BlockLink {
        /// Peer address
        addr: DeviceAddress,
        /// Identity address type
        addr_type: AddressType,
    },
    /// Stop rejecting the peer
    UnblockLink {
        /// Peer address
        addr: DeviceAddress,
        /// Identity address type
        addr_type: AddressType,
    },
    /// Push new kernel device flags
    SetDeviceFlags {
        /// Peer address
        addr: DeviceAddress,
        /// Requested flags value
        flags: u32,
    },
    /// Add the device to the passive-scan auto-connect list
    AddAutoConnect {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Remove the device from the passive-scan auto-connect list
    RemoveAutoConnect {
        /// Peer address
        addr: DeviceAddress,
    },

    // -- prompt replies --
    /// Answer a PIN request; `None` rejects
    PinCodeReply {
        /// Peer address
        addr: DeviceAddress,
        /// PIN code, `None` to reject
        pin: Option<String<MAX_PIN_LENGTH>>,
    },
    /// Answer a passkey request; `None` rejects
    PasskeyReply {
        /// Peer address
        addr: DeviceAddress,
        /// Address type of the prompt
        addr_type: AddressType,
        /// Passkey, `None` to reject
        passkey: Option<u32>,
    },
    /// Answer a confirm request
    ConfirmReply {
        /// Peer address
        addr: DeviceAddress,
        /// Address type of the prompt
        addr_type: AddressType,
        /// Positive or negative reply
        accept: bool,
    },

    // -- discovery / transport --
    /// Run one SDP search
    SdpSearch {
        /// Peer address
        addr: DeviceAddress,
        /// UUID to search for
        uuid: ServiceUuid,
    },
    /// Cancel the outstanding SDP search
    SdpCancel {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Open the ATT channel
    AttConnect {
        /// Peer address
        addr: DeviceAddress,
        /// Address type to connect
        addr_type: AddressType,
    },
    /// Close the ATT channel
    AttDisconnect {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Raise ATT security to trigger SMP
    ElevateSecurity {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Extract primary services from the GATT client
    GattDiscover {
        /// Peer address
        addr: DeviceAddress,
    },

    // -- agent --
    /// Ask the agent for a PIN
    AgentRequestPinCode {
        /// Peer address
        addr: DeviceAddress,
        /// Whether a 16-digit secure PIN is required
        secure: bool,
    },
    /// Ask the agent for a passkey
    AgentRequestPasskey {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Ask the agent to confirm a passkey
    AgentRequestConfirmation {
        /// Peer address
        addr: DeviceAddress,
        /// Passkey to compare
        passkey: u32,
    },
    /// Ask the agent for bare authorization
    AgentRequestAuthorization {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Show a passkey on the agent
    AgentDisplayPasskey {
        /// Peer address
        addr: DeviceAddress,
        /// Passkey to display
        passkey: u32,
        /// Digits entered so far
        entered: u8,
    },
    /// Show a PIN on the agent
    AgentDisplayPinCode {
        /// Peer address
        addr: DeviceAddress,
        /// PIN to display
        pin: String<MAX_PIN_LENGTH>,
    },
    /// Cancel the outstanding agent prompt
    AgentCancel {
        /// Peer address
        addr: DeviceAddress,
    },

    // -- services --
    /// Connect one profile-level service
    ConnectService {
        /// Peer address
        addr: DeviceAddress,
        /// Service UUID
        uuid: ServiceUuid,
    },
    /// Disconnect one profile-level service
    DisconnectService {
        /// Peer address
        addr: DeviceAddress,
        /// Service UUID
        uuid: ServiceUuid,
    },

    // -- persistence --
    /// Write the device info and cache records; the backend pulls them via
    /// [`store::snapshot`](crate::store::snapshot)
    StoreDevice {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Delete stored state for the device
    RemoveStore {
        /// Peer address
        addr: DeviceAddress,
    },

    // -- notifications --
    /// Disconnect watches fire before teardown, with the temporary hint
    NotifyDisconnectWatch {
        /// Peer address
        addr: DeviceAddress,
        /// Whether the device was still temporary
        temporary: bool,
    },
    /// The "Disconnected" signal with its reason
    EmitDisconnected {
        /// Peer address
        addr: DeviceAddress,
        /// Disconnect reason
        reason: DisconnectReason,
    },
    /// An observable property changed
    PropertyChanged {
        /// Peer address
        addr: DeviceAddress,
        /// Which property
        property: Property,
    },
    /// Deferred reply to an API request
    Reply {
        /// Request token
        id: RequestId,
        /// Outcome
        result: Result<(), DeviceError>,
    },
}

/// Collector for the side effects of one processing pass
///
/// Commands and property changes are data; the processor forwards them to
/// the embedding stack after the registry lock is dropped. Focus selects
/// the device whose properties subsequent [`Outbox::changed`] calls refer
/// to.
#[derive(Debug, Default)]
pub struct Outbox {
    commands: Vec<Command, MAX_COMMANDS>,
    changed: Vec<(DeviceAddress, Property), MAX_PROPERTY_CHANGES>,
    focus: Option<DeviceAddress>,
}

impl Outbox {
    /// Create an empty outbox
    #[must_use]
    pub const fn new() -> Self {
        Self {
            commands: Vec::new(),
            changed: Vec::new(),
            focus: None,
        }
    }

    /// Select the device subsequent property changes belong to
    pub fn focus(&mut self, addr: DeviceAddress) {
        self.focus = Some(addr);
    }

    /// Queue an outbound command
    pub fn command(&mut self, command: Command) {
        if self.commands.push(command).is_err() {
            defmt::error!("outbox command overflow");
        }
    }

    /// Record a property change for the focused device, coalescing repeats
    pub fn changed(&mut self, property: Property) {
        let addr = self.focus.unwrap_or(DeviceAddress([0; 6]));
        if self.changed.contains(&(addr, property)) {
            return;
        }
        if self.changed.push((addr, property)).is_err() {
            defmt::error!("outbox property overflow");
        }
    }

    /// Queue a deferred API reply
    pub fn reply(&mut self, id: RequestId, result: Result<(), DeviceError>) {
        self.command(Command::Reply { id, result });
    }

    /// Take the queued commands
    pub fn take_commands(&mut self) -> Vec<Command, MAX_COMMANDS> {
        core::mem::take(&mut self.commands)
    }

    /// Take the recorded property changes
    pub fn take_changes(&mut self) -> Vec<(DeviceAddress, Property), MAX_PROPERTY_CHANGES> {
        core::mem::take(&mut self.changed)
    }

    /// Test helper: the queued commands without draining
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Test helper: the recorded changes without draining
    #[must_use]
    pub fn changes(&self) -> &[(DeviceAddress, Property)] {
        &self.changed
    }
}

/// Identity and advertising data carried by a found/updated event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoundData {
    /// Remote name from EIR or the scan response
    pub name: Option<String<MAX_NAME_LENGTH>>,
    /// Class of device
    pub class: Option<u32>,
    /// LE appearance
    pub appearance: Option<u16>,
    /// Advertised TX power
    pub tx_power: Option<i8>,
    /// Advertising flags octet
    pub ad_flags: Option<u8>,
    /// Whether pre-SSP pairing was detected
    pub legacy_pairing: Option<bool>,
    /// Service UUIDs observed in the advertisement
    pub uuids: Vec<ServiceUuid, MAX_EIR_UUIDS>,
    /// Manufacturer data records
    pub manufacturer_data: Vec<(u16, Vec<u8, MAX_DATA_LEN>), MAX_DATA_RECORDS>,
    /// Service data records
    pub service_data: Vec<(ServiceUuid, Vec<u8, MAX_DATA_LEN>), MAX_DATA_RECORDS>,
    /// Raw advertising data records by AD type
    pub advertising_data: Vec<(u8, Vec<u8, MAX_DATA_LEN>), MAX_DATA_RECORDS>,
    /// Replace previously merged data records instead of appending
    pub replace_data: bool,
}

/// Events delivered to the registry by its collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Inquiry / advertising sighting
    Found {
        /// Peer address
        addr: DeviceAddress,
        /// Address type of the sighting
        addr_type: AddressType,
        /// Bearer the sighting came from
        bearer: BearerType,
        /// Signal strength when reported
        rssi: Option<i8>,
        /// Whether the advertisement was connectable
        connectable: bool,
        /// Parsed advertising payload
        data: FoundData,
    },
    /// A bearer link came up
    Connected {
        /// Peer address
        addr: DeviceAddress,
        /// Bearer of the link
        bearer: BearerType,
        /// The local host initiated the link
        initiator: bool,
    },
    /// A bearer link went down
    Disconnected {
        /// Peer address
        addr: DeviceAddress,
        /// Bearer of the link
        bearer: BearerType,
        /// Link loss reason
        reason: DisconnectReason,
    },
    /// Bonding finished at the management layer
    BondingComplete {
        /// Peer address
        addr: DeviceAddress,
        /// Bearer of the bonding
        bearer: BearerType,
        /// Outcome
        status: BondingStatus,
    },
    /// Long-term key delivered
    LongTermKey {
        /// Peer address
        addr: DeviceAddress,
        /// Key bytes
        key: [u8; 16],
        /// Local side was central
        central: bool,
        /// Encryption key size
        enc_size: u8,
    },
    /// Signature key delivered
    SignatureKey {
        /// Peer address
        addr: DeviceAddress,
        /// Raw key type (0x00..=0x03)
        kind: u8,
        /// Key bytes
        key: [u8; 16],
        /// Initial sign counter
        counter: u32,
        /// Whether persistence was requested
        store_hint: bool,
    },
    /// Set identity resolving key delivered
    SetIdentityKey {
        /// Peer address
        addr: DeviceAddress,
        /// Key bytes, possibly encrypted
        key: [u8; 16],
        /// Whether the key is LTK-encrypted
        encrypted: bool,
        /// Coordinated set size
        size: u8,
        /// Device rank in the set
        rank: u8,
    },
    /// Inbound signed write observed with its counter
    SignedWrite {
        /// Peer address
        addr: DeviceAddress,
        /// Claimed sign counter
        counter: u32,
    },
    /// Legacy PIN requested
    PinCodeRequested {
        /// Peer address
        addr: DeviceAddress,
        /// A 16-digit secure PIN is required
        secure: bool,
    },
    /// Passkey entry requested
    PasskeyRequested {
        /// Peer address
        addr: DeviceAddress,
        /// Address type of the prompt
        addr_type: AddressType,
    },
    /// Numeric comparison requested
    ConfirmRequested {
        /// Peer address
        addr: DeviceAddress,
        /// Address type of the prompt
        addr_type: AddressType,
        /// Passkey to compare
        passkey: u32,
        /// Just-works: no passkey will be displayed
        confirm_hint: bool,
    },
    /// Passkey display notification
    PasskeyNotify {
        /// Peer address
        addr: DeviceAddress,
        /// Address type of the prompt
        addr_type: AddressType,
        /// Passkey to display
        passkey: u32,
        /// Digits entered so far
        entered: u8,
    },
    /// PIN display notification
    PinCodeNotify {
        /// Peer address
        addr: DeviceAddress,
        /// A 16-digit secure PIN was generated
        secure: bool,
        /// The PIN to display
        pincode: String<MAX_PIN_LENGTH>,
    },
    /// The agent answered a prompt
    AgentReplied {
        /// Peer address
        addr: DeviceAddress,
        /// The reply
        reply: AgentReply,
    },
    /// One SDP search completed
    SdpResult {
        /// Peer address
        addr: DeviceAddress,
        /// Records found, or the bearer-tagged failure
        result: Result<SdpBatch, DeviceError>,
    },
    /// The GATT client is ready with its primary services
    GattReady {
        /// Peer address
        addr: DeviceAddress,
        /// Primary services from the attribute database
        primaries: Vec<GattPrimary, MAX_PRIMARIES>,
    },
    /// The remote GATT database changed
    GattServicesChanged {
        /// Peer address
        addr: DeviceAddress,
    },
    /// A profile finished a connect attempt
    ServiceConnected {
        /// Peer address
        addr: DeviceAddress,
        /// Service UUID
        uuid: ServiceUuid,
        /// Outcome
        result: Result<(), DeviceError>,
    },
    /// A profile finished disconnecting
    ServiceDisconnected {
        /// Peer address
        addr: DeviceAddress,
        /// Service UUID
        uuid: ServiceUuid,
    },
    /// Kernel device flags changed
    FlagsChanged {
        /// Peer address
        addr: DeviceAddress,
        /// Supported flag bits
        supported: u32,
        /// Current flag bits
        current: u32,
    },
    /// An RPA resolved to an identity address
    AddressResolved {
        /// The private address the device was known by
        rpa: DeviceAddress,
        /// Identity address
        identity: DeviceAddress,
        /// Identity address type
        identity_type: AddressType,
    },
    /// Remote name resolution failed
    NameResolveFailed {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Adapter powered up or down
    AdapterPowered {
        /// New power state
        powered: bool,
    },
}

/// API requests sent to the request processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Token the response will carry
    pub id: RequestId,
    /// The operation
    pub op: RequestOp,
}

/// Operations exposed through the channel API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOp {
    /// connect()
    Connect {
        /// Peer address
        addr: DeviceAddress,
    },
    /// `connect_profile(uuid)`
    ConnectProfile {
        /// Peer address
        addr: DeviceAddress,
        /// Profile UUID
        uuid: ServiceUuid,
    },
    /// disconnect()
    Disconnect {
        /// Peer address
        addr: DeviceAddress,
    },
    /// `disconnect_profile(uuid)`
    DisconnectProfile {
        /// Peer address
        addr: DeviceAddress,
        /// Profile UUID
        uuid: ServiceUuid,
    },
    /// pair()
    Pair {
        /// Peer address
        addr: DeviceAddress,
        /// Agent IO capability
        io_cap: IoCapability,
        /// Whether the caller brought an agent
        agent_present: bool,
    },
    /// `cancel_pairing()`
    CancelPairing {
        /// Peer address
        addr: DeviceAddress,
    },
    /// block()
    Block {
        /// Peer address
        addr: DeviceAddress,
    },
    /// unblock()
    Unblock {
        /// Peer address
        addr: DeviceAddress,
    },
    /// Set the Trusted property
    SetTrusted {
        /// Peer address
        addr: DeviceAddress,
        /// New value
        trusted: bool,
    },
    /// Set the Alias property
    SetAlias {
        /// Peer address
        addr: DeviceAddress,
        /// New alias, empty to reset
        alias: String<MAX_NAME_LENGTH>,
    },
    /// Set the WakeAllowed property
    SetWakeAllowed {
        /// Peer address
        addr: DeviceAddress,
        /// New value
        allowed: bool,
    },
    /// Set the PreferredBearer property
    SetPreferredBearer {
        /// Peer address
        addr: DeviceAddress,
        /// New policy
        prefer: PreferredBearer,
    },
    /// Remove the device, optionally deleting stored state
    RemoveDevice {
        /// Peer address
        addr: DeviceAddress,
        /// Also delete persistent state
        remove_stored: bool,
    },
    /// Read a device snapshot
    GetDevice {
        /// Peer address
        addr: DeviceAddress,
    },
}

/// API responses from the request processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Operation finished
    Complete {
        /// Request token
        id: RequestId,
        /// Outcome
        result: Result<(), DeviceError>,
    },
    /// Snapshot readout
    Device {
        /// Request token
        id: RequestId,
        /// The snapshot, or why it is unavailable
        result: Result<DeviceSnapshot, DeviceError>,
    },
}
