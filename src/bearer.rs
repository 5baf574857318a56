//! Per-bearer state and bearer selection
//!
//! A dual-mode device is reachable over two bearers that keep independent
//! pairing, bonding and connection state. This module holds the per-bearer
//! record and the selection rules deciding which bearer a connect or pair
//! request should use.

use embassy_time::Instant;

use crate::{AddressType, constants::SEEN_THRESHOLD};

/// One of the two link layers a device can be reached on
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format, serde::Serialize, serde::Deserialize)]
pub enum BearerType {
    /// Classic (Basic Rate / Enhanced Data Rate)
    BrEdr,
    /// Low Energy
    Le,
}

impl BearerType {
    /// The bearer an address type naturally belongs to
    #[must_use]
    pub const fn natural(addr_type: AddressType) -> Self {
        match addr_type {
            AddressType::BrEdr => Self::BrEdr,
            AddressType::LePublic | AddressType::LeRandom => Self::Le,
        }
    }
}

impl From<AddressType> for BearerType {
    fn from(addr_type: AddressType) -> Self {
        Self::natural(addr_type)
    }
}

/// Which bearer connect requests should favor
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format, serde::Serialize, serde::Deserialize)]
pub enum PreferredBearer {
    /// Favor whichever bearer was used last
    LastUsed,
    /// Always favor LE
    Le,
    /// Always favor BR/EDR
    BrEdr,
    /// Favor whichever bearer was seen last
    LastSeen,
}

impl PreferredBearer {
    /// Stable string form
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LastUsed => "last-used",
            Self::Le => "le",
            Self::BrEdr => "bredr",
            Self::LastSeen => "last-seen",
        }
    }

    /// Parse the stable string form
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "last-used" => Some(Self::LastUsed),
            "le" => Some(Self::Le),
            "bredr" => Some(Self::BrEdr),
            "last-seen" => Some(Self::LastSeen),
            _ => None,
        }
    }
}

impl Default for PreferredBearer {
    fn default() -> Self {
        Self::LastUsed
    }
}

/// Per-bearer device state
///
/// `last_seen`/`last_used` are `None` until the first sighting/use; a bearer
/// that was never seen is always treated as stale by the selection rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearerState {
    /// This bearer is favored by the preferred-bearer policy
    pub prefer: bool,
    /// Keys were exchanged on this bearer this session
    pub paired: bool,
    /// Keys for this bearer are persisted
    pub bonded: bool,
    /// A link is currently up on this bearer
    pub connected: bool,
    /// Discovery has completed on this bearer
    pub svc_resolved: bool,
    /// The local host initiated the current link
    pub initiator: bool,
    /// The device currently accepts connections on this bearer
    pub connectable: bool,
    /// Last advertisement/inquiry sighting
    pub last_seen: Option<Instant>,
    /// Last time a link was established on this bearer
    pub last_used: Option<Instant>,
}

impl BearerState {
    /// Freshness of this bearer: time since last sighting, if it is recent
    /// enough to matter and the bearer is connectable
    fn freshness(&self, now: Instant) -> Option<embassy_time::Duration> {
        if !self.connectable {
            return None;
        }
        let seen = self.last_seen?;
        let age = now.saturating_duration_since(seen);
        if age > SEEN_THRESHOLD {
            return None;
        }
        Some(age)
    }
}

/// Inputs to bearer selection
#[derive(Debug, Clone, Copy)]
pub struct BearerView<'a> {
    /// BR/EDR bearer state, when the bearer is present
    pub bredr: Option<&'a BearerState>,
    /// LE bearer state, when the bearer is present
    pub le: Option<&'a BearerState>,
    /// The device identity address type
    pub addr_type: AddressType,
    /// Whether the local adapter supports BR/EDR at all
    pub adapter_bredr: bool,
}

/// Choose the bearer for a connect request
///
/// In order: single present bearer, the solely bonded bearer, the preferred
/// bearer, LE for random addresses, then freshness with a BR/EDR tiebreak
/// (an advertisement carrying the BR/EDR flag tends to be freshest when the
/// timestamps are equal).
#[must_use]
pub fn select_connect_bearer(view: &BearerView<'_>, now: Instant) -> BearerType {
    let (bredr, le) = match (view.bredr, view.le) {
        (Some(b), Some(l)) => (b, l),
        (Some(_), None) => return BearerType::BrEdr,
        _ => return BearerType::Le,
    };

    if bredr.bonded && !le.bonded {
        return BearerType::BrEdr;
    }
    if le.bonded && !bredr.bonded {
        return BearerType::Le;
    }

    if bredr.prefer && !le.prefer {
        return BearerType::BrEdr;
    }
    if le.prefer && !bredr.prefer {
        return BearerType::Le;
    }

    if view.addr_type == AddressType::LeRandom {
        return BearerType::Le;
    }

    let bredr_age = bredr.freshness(now);
    let le_age = le.freshness(now);

    match (bredr_age, le_age) {
        (None, None) => BearerType::natural(view.addr_type),
        (Some(_), None) => BearerType::BrEdr,
        (None, Some(_)) => BearerType::Le,
        (Some(b), Some(l)) => {
            if b <= l && view.adapter_bredr {
                BearerType::BrEdr
            } else {
                BearerType::Le
            }
        }
    }
}

/// Choose the bearer for a pair request
///
/// Dual-mode devices pair the not-yet-bonded bearer first; everything else
/// follows the connect selection. A single-bearer device always pairs on
/// its own bearer.
#[must_use]
pub fn select_pair_bearer(view: &BearerView<'_>, now: Instant) -> BearerType {
    let (bredr, le) = match (view.bredr, view.le) {
        (Some(b), Some(l)) => (b, l),
        (Some(_), None) => return BearerType::BrEdr,
        _ => return BearerType::Le,
    };

    if bredr.bonded {
        return BearerType::Le;
    }
    if le.bonded {
        return BearerType::BrEdr;
    }

    select_connect_bearer(view, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::Duration;

    fn seen(now: Instant, ago: u64) -> BearerState {
        BearerState {
            connectable: true,
            last_seen: Some(now - Duration::from_secs(ago)),
            ..BearerState::default()
        }
    }

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    #[test]
    fn test_single_bearer_wins() {
        let now = at(1000);
        let state = BearerState::default();

        let view = BearerView {
            bredr: Some(&state),
            le: None,
            addr_type: AddressType::BrEdr,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::BrEdr);

        let view = BearerView {
            bredr: None,
            le: Some(&state),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_solely_bonded_bearer_wins() {
        let now = at(1000);
        let bonded = BearerState {
            bonded: true,
            ..BearerState::default()
        };
        let plain = BearerState::default();

        let view = BearerView {
            bredr: Some(&plain),
            le: Some(&bonded),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);

        let view = BearerView {
            bredr: Some(&bonded),
            le: Some(&plain),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::BrEdr);
    }

    #[test]
    fn test_prefer_flag_wins_when_neither_bonded() {
        let now = at(1000);
        let preferred = BearerState {
            prefer: true,
            ..BearerState::default()
        };
        let plain = BearerState::default();

        let view = BearerView {
            bredr: Some(&plain),
            le: Some(&preferred),
            addr_type: AddressType::BrEdr,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_random_address_forces_le() {
        let now = at(1000);
        let bredr = seen(now, 1);
        let le = BearerState::default();

        let view = BearerView {
            bredr: Some(&bredr),
            le: Some(&le),
            addr_type: AddressType::LeRandom,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_freshness_picks_most_recent() {
        let now = at(1000);
        let bredr = seen(now, 200);
        let le = seen(now, 10);

        let view = BearerView {
            bredr: Some(&bredr),
            le: Some(&le),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_freshness_tie_breaks_to_bredr() {
        let now = at(1000);
        let bredr = seen(now, 10);
        let le = seen(now, 10);

        let view = BearerView {
            bredr: Some(&bredr),
            le: Some(&le),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::BrEdr);

        // ...unless the adapter has no BR/EDR side
        let view = BearerView {
            adapter_bredr: false,
            ..view
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_stale_sightings_are_unknown() {
        let now = at(1000);
        // Older than the 300 s threshold
        let bredr = seen(now, 400);
        let le = seen(now, 350);

        let view = BearerView {
            bredr: Some(&bredr),
            le: Some(&le),
            addr_type: AddressType::BrEdr,
            adapter_bredr: true,
        };
        // Both unknown: the address type's natural bearer wins
        assert_eq!(select_connect_bearer(&view, now), BearerType::BrEdr);

        let view = BearerView {
            addr_type: AddressType::LePublic,
            ..view
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_never_seen_counts_as_unknown() {
        let now = at(1000);
        let bredr = seen(now, 20);
        let le = BearerState {
            connectable: true,
            ..BearerState::default()
        };

        let view = BearerView {
            bredr: Some(&bredr),
            le: Some(&le),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::BrEdr);
    }

    #[test]
    fn test_unconnectable_bearer_is_not_fresh() {
        let now = at(1000);
        let mut bredr = seen(now, 5);
        bredr.connectable = false;
        let le = seen(now, 100);

        let view = BearerView {
            bredr: Some(&bredr),
            le: Some(&le),
            addr_type: AddressType::BrEdr,
            adapter_bredr: true,
        };
        assert_eq!(select_connect_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_pair_bearer_picks_unbonded_side() {
        let now = at(1000);
        let bonded = BearerState {
            bonded: true,
            ..BearerState::default()
        };
        let plain = BearerState::default();

        let view = BearerView {
            bredr: Some(&bonded),
            le: Some(&plain),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_pair_bearer(&view, now), BearerType::Le);

        let view = BearerView {
            bredr: Some(&plain),
            le: Some(&bonded),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_pair_bearer(&view, now), BearerType::BrEdr);
    }

    #[test]
    fn test_pair_bearer_single_mode_ignores_bonded() {
        let now = at(1000);
        let bonded = BearerState {
            bonded: true,
            ..BearerState::default()
        };

        let view = BearerView {
            bredr: None,
            le: Some(&bonded),
            addr_type: AddressType::LePublic,
            adapter_bredr: true,
        };
        assert_eq!(select_pair_bearer(&view, now), BearerType::Le);
    }

    #[test]
    fn test_preferred_bearer_string_round_trip() {
        for pref in [
            PreferredBearer::LastUsed,
            PreferredBearer::Le,
            PreferredBearer::BrEdr,
            PreferredBearer::LastSeen,
        ] {
            assert_eq!(PreferredBearer::from_str(pref.as_str()), Some(pref));
        }
        assert_eq!(PreferredBearer::from_str("classic"), None);
    }
}
