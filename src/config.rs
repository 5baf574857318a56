//! Registry policy configuration
//!
//! Tunables that the embedding stack decides once at startup. Fixed
//! protocol timings live in [`crate::constants`].

use embassy_time::Duration;

/// Policy for numeric-comparison prompts that arrive with a just-works hint
/// for an already paired device
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum JustWorksRepairing {
    /// Auto-reject the re-pairing attempt
    Never,
    /// Forward the request to the agent
    Confirm,
    /// Auto-accept the re-pairing attempt
    Always,
}

/// Registry-wide policy knobs
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// How long an idle temporary device stays registered
    pub temporary_timeout: Duration,
    /// Delay before a failed name resolution may be retried
    pub name_resolve_retry_delay: Duration,
    /// Re-pairing policy for just-works confirmations
    pub jw_repairing: JustWorksRepairing,
    /// Connect the ATT channel before starting LE bonding
    pub le_connect_before_pairing: bool,
    /// Start service discovery for pairings initiated by the remote side
    pub reverse_discovery: bool,
    /// Re-run discovery on every connect instead of trusting the cache
    pub refresh_discovery: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            temporary_timeout: Duration::from_secs(30),
            name_resolve_retry_delay: Duration::from_secs(300),
            jw_repairing: JustWorksRepairing::Never,
            le_connect_before_pairing: true,
            reverse_discovery: true,
            refresh_discovery: false,
        }
    }
}
