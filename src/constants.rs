//! `bondkeeper` Constants
//!
//! Capacity bounds for the heapless collections and the fixed protocol
//! timings used throughout the library. Policy-configurable timings live in
//! [`crate::config::RegistryConfig`] instead.

use embassy_time::Duration;

/// Maximum number of devices tracked by a registry
pub const MAX_DEVICES: usize = 16;

/// Maximum number of services attached to a single device
pub const MAX_SERVICES: usize = 8;

/// Maximum number of registered profiles
pub const MAX_PROFILES: usize = 16;

/// Maximum number of resolved service UUIDs per device
pub const MAX_UUIDS: usize = 24;

/// Maximum number of EIR/advertising observed UUIDs per device
pub const MAX_EIR_UUIDS: usize = 16;

/// Maximum number of primary GATT services per device
pub const MAX_PRIMARIES: usize = 8;

/// Maximum number of set identity resolving keys per device
pub const MAX_SIRKS: usize = 4;

/// Maximum number of manufacturer/service/advertising data records
pub const MAX_DATA_RECORDS: usize = 4;

/// Maximum payload of a single manufacturer/service/advertising data record
pub const MAX_DATA_LEN: usize = 32;

/// Maximum device name length in bytes
pub const MAX_NAME_LENGTH: usize = 64;

/// Maximum modalias string length
pub const MAX_MODALIAS_LENGTH: usize = 32;

/// Maximum queued outbound commands per processing pass
pub const MAX_COMMANDS: usize = 32;

/// Maximum coalesced property changes per processing pass
pub const MAX_PROPERTY_CHANGES: usize = 16;

/// Maximum number of candidate PIN codes tried for legacy pairing
pub const MAX_PIN_CANDIDATES: usize = 4;

/// Maximum PIN code length in bytes
pub const MAX_PIN_LENGTH: usize = 16;

/// Capacity of the API request/response channels
pub const MAX_CHANNELS: usize = 8;

/// Grace period between a disconnect request and forced bearer teardown
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Backoff before a failed bonding attempt is retried
pub const BONDING_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Deferral before reverse service discovery after an inbound pairing
pub const DISCOVERY_DEFER: Duration = Duration::from_secs(1);

/// A bearer sighting older than this no longer counts as fresh
pub const SEEN_THRESHOLD: Duration = Duration::from_secs(300);

/// Minimum RSSI delta that is worth reporting
pub const RSSI_DELTA_THRESHOLD: i16 = 8;

/// TX power sentinel meaning "never observed"
pub const TX_POWER_UNKNOWN: i8 = 127;
