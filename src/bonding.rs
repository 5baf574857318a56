//! Bonding engine and authentication requests
//!
//! Exactly one bonding attempt runs per device. The request record keeps
//! the caller token, the chosen bearer, retry timing with per-attempt
//! duration measurement and the legacy-PIN candidate iterator. Credential
//! prompts from the management layer become short-lived
//! [`AuthenticationRequest`] records, at most one per device.

use embassy_time::{Duration, Instant};
use heapless::{String, Vec};

use crate::{
    AddressType, BearerType, BondingStatus, RequestId,
    config::JustWorksRepairing,
    constants::{BONDING_RETRY_DELAY, MAX_PIN_CANDIDATES, MAX_PIN_LENGTH},
};

/// Agent input/output capability announced to the management layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum IoCapability {
    /// Can display a passkey but take no input
    DisplayOnly,
    /// Can display and answer yes/no
    DisplayYesNo,
    /// Keyboard input only
    KeyboardOnly,
    /// No input, no output; pairing is just-works
    NoInputNoOutput,
    /// Full keyboard and display
    KeyboardDisplay,
}

/// Candidate PIN codes tried in order for legacy pairing
#[derive(Debug, Default)]
pub struct PinIterator {
    candidates: Vec<String<MAX_PIN_LENGTH>, MAX_PIN_CANDIDATES>,
    index: usize,
}

impl PinIterator {
    /// Build an iterator over fixed candidates
    #[must_use]
    pub fn new(candidates: &[&str]) -> Self {
        let mut list = Vec::new();
        for pin in candidates {
            let mut s = String::new();
            if s.push_str(pin).is_ok() {
                list.push(s).ok();
            }
        }
        Self {
            candidates: list,
            index: 0,
        }
    }

    /// The next candidate PIN, advancing the cursor
    pub fn next_pin(&mut self) -> Option<&str> {
        let pin = self.candidates.get(self.index)?;
        self.index += 1;
        Some(pin.as_str())
    }

    /// Whether no candidates remain
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.index >= self.candidates.len()
    }
}

/// The one in-flight bonding attempt of a device
#[derive(Debug)]
pub struct BondingRequest {
    /// Reply token of the caller, `None` for remotely initiated pairing
    pub id: Option<RequestId>,
    /// Bearer the bonding runs on
    pub bearer: BearerType,
    /// IO capability derived from the caller's agent
    pub io_cap: IoCapability,
    /// Status of the most recent failed attempt
    pub status: BondingStatus,
    /// Deadline of the scheduled retry, when one is pending
    pub retry_at: Option<Instant>,
    /// Legacy PIN strategy iterator
    pub pin_iter: PinIterator,
    /// Whether the caller brought an agent
    pub agent_present: bool,
    attempt_started: Option<Instant>,
    last_attempt_duration: Option<Duration>,
}

impl BondingRequest {
    /// Record a new bonding attempt
    #[must_use]
    pub fn new(id: Option<RequestId>, bearer: BearerType, io_cap: IoCapability) -> Self {
        Self {
            id,
            bearer,
            io_cap,
            status: BondingStatus::Success,
            retry_at: None,
            pin_iter: PinIterator::default(),
            agent_present: false,
            attempt_started: None,
            last_attempt_duration: None,
        }
    }

    /// Mark the start of an attempt for duration measurement
    pub fn start_attempt(&mut self, now: Instant) {
        self.attempt_started = Some(now);
    }

    /// Restart the attempt timer, e.g. when a retry begins
    pub fn restart_timer(&mut self, now: Instant) {
        self.attempt_started = Some(now);
    }

    /// Mark the end of an attempt, computing its duration
    pub fn stop_timer(&mut self, now: Instant) {
        if let Some(started) = self.attempt_started.take() {
            self.last_attempt_duration = Some(now.saturating_duration_since(started));
        }
    }

    /// Duration of the last completed attempt
    #[must_use]
    pub fn last_attempt_duration(&self) -> Option<Duration> {
        self.last_attempt_duration
    }

    /// Whether a retry is currently scheduled
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        self.retry_at.is_some()
    }

    /// Try to schedule a retry after a failed attempt
    ///
    /// Further failure events while a retry is already pending are ignored
    /// and return the existing deadline. A retry is only available while
    /// the PIN iterator has candidates left; the attempt timer is stopped
    /// so the delta can be measured. Returns `None` when no retry is
    /// possible.
    pub fn attempt_retry(&mut self, now: Instant) -> Option<Instant> {
        if let Some(deadline) = self.retry_at {
            return Some(deadline);
        }
        self.stop_timer(now);

        if self.pin_iter.exhausted() {
            return None;
        }

        let deadline = now + BONDING_RETRY_DELAY;
        self.retry_at = Some(deadline);
        defmt::debug!("scheduling bonding retry");
        Some(deadline)
    }

    /// Whether the scheduled retry is due, consuming the deadline if so
    pub fn take_due_retry(&mut self, now: Instant) -> bool {
        match self.retry_at {
            Some(deadline) if now >= deadline => {
                self.retry_at = None;
                true
            }
            _ => false,
        }
    }
}

/// Kind of credential prompt in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum AuthKind {
    /// Legacy PIN code request
    PinCode {
        /// A 16-digit secure PIN is required
        secure: bool,
    },
    /// Passkey entry request
    Passkey,
    /// Numeric comparison request
    Confirm,
    /// Display a passkey to the user
    NotifyPasskey,
    /// Display a generated PIN to the user
    NotifyPincode {
        /// A 16-digit secure PIN was generated
        secure: bool,
    },
}

impl AuthKind {
    /// Whether the management layer expects a reply for this prompt
    ///
    /// Display-only prompts are fire and forget.
    #[must_use]
    pub const fn needs_reply(&self) -> bool {
        !matches!(self, Self::NotifyPasskey)
    }
}

/// An in-progress credential prompt
#[derive(Debug)]
pub struct AuthenticationRequest {
    /// Prompt kind
    pub kind: AuthKind,
    /// Address type the prompt arrived on
    pub addr_type: AddressType,
    /// Passkey for confirm/notify prompts
    pub passkey: Option<u32>,
    /// PIN for notify prompts
    pub pincode: Option<String<MAX_PIN_LENGTH>>,
}

impl AuthenticationRequest {
    /// Create a prompt record
    #[must_use]
    pub fn new(kind: AuthKind, addr_type: AddressType) -> Self {
        Self {
            kind,
            addr_type,
            passkey: None,
            pincode: None,
        }
    }
}

/// Resolution of an incoming numeric-comparison request
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum ConfirmAction {
    /// Reply positive without involving the agent
    AutoAccept,
    /// Reply negative without involving the agent
    AutoReject,
    /// Ask the agent for bare authorization (just-works with hint)
    RequestAuthorization,
    /// Ask the agent to compare the passkey
    RequestConfirmation,
}

/// Decide how to handle a confirm request
///
/// `confirm_hint` set means the remote offers just-works: no passkey will
/// be displayed. Re-pairing an already paired device this way is governed
/// by policy; an active locally initiated bonding implies consent.
#[must_use]
pub fn confirm_action(
    confirm_hint: bool,
    already_paired: bool,
    bonding_active: bool,
    policy: JustWorksRepairing,
) -> ConfirmAction {
    if confirm_hint && already_paired {
        match policy {
            JustWorksRepairing::Never => return ConfirmAction::AutoReject,
            JustWorksRepairing::Always => return ConfirmAction::AutoAccept,
            JustWorksRepairing::Confirm => {}
        }
    }

    if confirm_hint {
        if bonding_active {
            return ConfirmAction::AutoAccept;
        }
        return ConfirmAction::RequestAuthorization;
    }

    ConfirmAction::RequestConfirmation
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> Instant {
        Instant::from_secs(secs)
    }

    #[test]
    fn test_pin_iterator_walks_candidates() {
        let mut iter = PinIterator::new(&["0000", "1234"]);
        assert!(!iter.exhausted());
        assert_eq!(iter.next_pin(), Some("0000"));
        assert_eq!(iter.next_pin(), Some("1234"));
        assert!(iter.exhausted());
        assert_eq!(iter.next_pin(), None);
    }

    #[test]
    fn test_attempt_duration_measurement() {
        let mut req = BondingRequest::new(Some(RequestId(1)), BearerType::BrEdr, IoCapability::NoInputNoOutput);
        req.start_attempt(at(100));
        req.stop_timer(at(104));
        assert_eq!(req.last_attempt_duration(), Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_retry_needs_pin_candidates() {
        let mut req = BondingRequest::new(None, BearerType::BrEdr, IoCapability::NoInputNoOutput);
        req.start_attempt(at(100));
        assert!(req.attempt_retry(at(101)).is_none());

        let mut req = BondingRequest::new(None, BearerType::BrEdr, IoCapability::NoInputNoOutput);
        req.pin_iter = PinIterator::new(&["0000"]);
        let deadline = req.attempt_retry(at(101)).unwrap();
        assert_eq!(deadline, at(101) + BONDING_RETRY_DELAY);
        assert!(req.is_retrying());
    }

    #[test]
    fn test_failures_while_retrying_are_ignored() {
        let mut req = BondingRequest::new(None, BearerType::BrEdr, IoCapability::NoInputNoOutput);
        req.pin_iter = PinIterator::new(&["0000", "1234"]);

        let first = req.attempt_retry(at(100)).unwrap();
        let second = req.attempt_retry(at(101)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_retry_fires_once_due() {
        let mut req = BondingRequest::new(None, BearerType::BrEdr, IoCapability::NoInputNoOutput);
        req.pin_iter = PinIterator::new(&["0000"]);
        let deadline = req.attempt_retry(at(100)).unwrap();

        assert!(!req.take_due_retry(deadline - Duration::from_millis(1)));
        assert!(req.take_due_retry(deadline));
        assert!(!req.is_retrying());
        assert!(!req.take_due_retry(deadline + Duration::from_secs(1)));
    }

    #[test]
    fn test_notify_passkey_needs_no_reply() {
        assert!(!AuthKind::NotifyPasskey.needs_reply());
        assert!(AuthKind::PinCode { secure: false }.needs_reply());
        assert!(AuthKind::Passkey.needs_reply());
        assert!(AuthKind::Confirm.needs_reply());
        assert!(AuthKind::NotifyPincode { secure: true }.needs_reply());
    }

    #[test]
    fn test_jw_repairing_policy() {
        // Paired device, just-works hint: the policy decides
        assert_eq!(
            confirm_action(true, true, false, JustWorksRepairing::Never),
            ConfirmAction::AutoReject
        );
        assert_eq!(
            confirm_action(true, true, false, JustWorksRepairing::Always),
            ConfirmAction::AutoAccept
        );
        // Confirm falls through to the agent
        assert_eq!(
            confirm_action(true, true, false, JustWorksRepairing::Confirm),
            ConfirmAction::RequestAuthorization
        );
    }

    #[test]
    fn test_confirm_during_local_bonding_auto_accepts() {
        assert_eq!(
            confirm_action(true, false, true, JustWorksRepairing::Never),
            ConfirmAction::AutoAccept
        );
    }

    #[test]
    fn test_confirm_without_hint_asks_agent() {
        assert_eq!(
            confirm_action(false, false, false, JustWorksRepairing::Never),
            ConfirmAction::RequestConfirmation
        );
        assert_eq!(
            confirm_action(false, true, true, JustWorksRepairing::Never),
            ConfirmAction::RequestConfirmation
        );
    }
}
