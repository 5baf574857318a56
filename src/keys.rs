//! Key material store
//!
//! Security material learned for a device: the long-term key, the two
//! connection signature resolving keys with their monotonic counters, and
//! any set identity resolving keys. Mutations report whether the change
//! needs to reach stable storage so the owner can schedule a writeback.

use heapless::Vec;

use crate::constants::MAX_SIRKS;

/// Long-term key established by bonding
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LtkInfo {
    /// The 128-bit key
    pub key: [u8; 16],
    /// Whether the local side was central when the key was distributed
    pub central: bool,
    /// Negotiated encryption key size in bytes
    pub enc_size: u8,
}

/// Direction of a received signature key
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum CsrkKind {
    /// Unauthenticated key for outbound signed writes
    LocalUnauthenticated,
    /// Unauthenticated key for inbound signed writes
    RemoteUnauthenticated,
    /// Authenticated key for outbound signed writes
    LocalAuthenticated,
    /// Authenticated key for inbound signed writes
    RemoteAuthenticated,
}

impl CsrkKind {
    /// Decode the two-bit key type distributed by the management layer
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Self::LocalUnauthenticated),
            0x01 => Some(Self::RemoteUnauthenticated),
            0x02 => Some(Self::LocalAuthenticated),
            0x03 => Some(Self::RemoteAuthenticated),
            _ => None,
        }
    }

    const fn is_local(self) -> bool {
        matches!(self, Self::LocalUnauthenticated | Self::LocalAuthenticated)
    }

    const fn is_authenticated(self) -> bool {
        matches!(self, Self::LocalAuthenticated | Self::RemoteAuthenticated)
    }
}

/// Connection signature resolving key with its sign counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CsrkInfo {
    /// The 128-bit key
    pub key: [u8; 16],
    /// Sign counter, monotonically non-decreasing
    pub counter: u32,
    /// Whether the key was distributed over an authenticated pairing
    pub authenticated: bool,
}

/// Set identity resolving key
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SirkInfo {
    /// The 128-bit key, possibly still encrypted
    pub key: [u8; 16],
    /// Whether the key material is encrypted with the LTK
    pub encrypted: bool,
    /// Size of the coordinated set
    pub size: u8,
    /// Rank of this device inside the set
    pub rank: u8,
    /// Whether this key currently participates in a device set
    pub in_set: bool,
}

/// All security material owned by one device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStore {
    /// Long-term key, if bonding completed
    pub ltk: Option<LtkInfo>,
    /// Key signing our outbound writes
    pub local_csrk: Option<CsrkInfo>,
    /// Key verifying inbound writes
    pub remote_csrk: Option<CsrkInfo>,
    /// Set identity resolving keys, unique by raw key bytes
    pub sirks: Vec<SirkInfo, MAX_SIRKS>,
}

impl KeyStore {
    /// Install or replace the long-term key
    ///
    /// Returns the SIRKs that become usable now that an LTK is available to
    /// decrypt them: encrypted keys not yet in a set.
    pub fn set_ltk(&mut self, key: [u8; 16], central: bool, enc_size: u8) -> Vec<usize, MAX_SIRKS> {
        self.ltk = Some(LtkInfo {
            key,
            central,
            enc_size,
        });

        let mut unlocked = Vec::new();
        for (i, sirk) in self.sirks.iter().enumerate() {
            if sirk.encrypted && !sirk.in_set {
                unlocked.push(i).ok();
            }
        }
        unlocked
    }

    /// Install a received signature key
    pub fn set_csrk(&mut self, kind: CsrkKind, key: [u8; 16], counter: u32) {
        let info = CsrkInfo {
            key,
            counter,
            authenticated: kind.is_authenticated(),
        };
        if kind.is_local() {
            self.local_csrk = Some(info);
        } else {
            self.remote_csrk = Some(info);
        }
    }

    /// Account for one outbound signed write
    ///
    /// Returns the counter value to sign with, or `None` when no local key
    /// exists.
    pub fn next_local_sign_counter(&mut self) -> Option<u32> {
        let csrk = self.local_csrk.as_mut()?;
        csrk.counter = csrk.counter.wrapping_add(1);
        Some(csrk.counter)
    }

    /// Validate the counter of an inbound signed write
    ///
    /// The stored counter only moves forward: a counter lower than the
    /// stored one leaves the store untouched and the write is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`crate::DeviceError::KeyMissing`] without a remote key and
    /// [`crate::DeviceError::AuthenticationRejected`] for a stale counter.
    pub fn accept_remote_sign_counter(&mut self, counter: u32) -> Result<(), crate::DeviceError> {
        let csrk = self
            .remote_csrk
            .as_mut()
            .ok_or(crate::DeviceError::KeyMissing)?;
        if counter < csrk.counter {
            return Err(crate::DeviceError::AuthenticationRejected);
        }
        csrk.counter = counter;
        Ok(())
    }

    /// Add a set identity resolving key, unique by raw key bytes
    ///
    /// An existing key with the same bytes is returned as-is. Returns the
    /// index of the key and whether it was newly added.
    pub fn add_sirk(&mut self, key: [u8; 16], encrypted: bool, size: u8, rank: u8) -> (usize, bool) {
        if let Some(i) = self.sirks.iter().position(|s| s.key == key) {
            return (i, false);
        }

        let sirk = SirkInfo {
            key,
            encrypted,
            size,
            rank,
            in_set: false,
        };
        if self.sirks.push(sirk).is_err() {
            defmt::warn!("sirk list full, dropping oldest");
            self.sirks.remove(0);
            self.sirks.push(sirk).ok();
        }
        (self.sirks.len() - 1, true)
    }

    /// Whether a SIRK can participate in a device set right now
    ///
    /// Plaintext keys always can; encrypted keys need the LTK.
    #[must_use]
    pub fn sirk_usable(&self, index: usize) -> bool {
        match self.sirks.get(index) {
            Some(sirk) => !sirk.encrypted || self.ltk.is_some(),
            None => false,
        }
    }

    /// Mark a SIRK as joined to a device set
    pub fn mark_sirk_in_set(&mut self, index: usize) {
        if let Some(sirk) = self.sirks.get_mut(index) {
            sirk.in_set = true;
        }
    }

    /// Drop everything, e.g. when stored bonding material is removed
    pub fn clear(&mut self) {
        self.ltk = None;
        self.local_csrk = None;
        self.remote_csrk = None;
        self.sirks.clear();
    }
}
