//! Browse engine: service discovery requests
//!
//! At most one discovery runs per device: an SDP walk over BR/EDR or a GATT
//! primary-service discovery over LE. The request record accumulates
//! results across the multi-step SDP sequence, remembers the parked caller
//! and survives until completion, cancellation or device removal.

use heapless::Vec;

use crate::{
    BearerType, RequestId,
    cache::DeviceId,
    constants::{MAX_PRIMARIES, MAX_UUIDS},
    uuid::{SDP_BROWSE_ORDER, ServiceUuid},
};

/// Which discovery mechanism a browse uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum BrowseKind {
    /// SDP record walk over BR/EDR
    Sdp,
    /// GATT primary service discovery over LE
    Gatt,
}

/// A primary GATT service extracted from discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GattPrimary {
    /// Service UUID
    pub uuid: ServiceUuid,
    /// First attribute handle of the service range
    pub start_handle: u16,
    /// Last attribute handle of the service range
    pub end_handle: u16,
}

/// The operation whose reply is parked on a browse
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum BrowseWaiterOp {
    /// Plain service discovery
    Discover,
    /// connect() parked until services resolve
    Connect,
    /// `connect_profile()` parked until services resolve
    ConnectProfile(ServiceUuid),
    /// pair() parked until post-bond discovery completes
    Pair,
}

/// A parked caller waiting for browse completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowseWaiter {
    /// Reply token of the parked request
    pub id: RequestId,
    /// What to do when the browse completes
    pub op: BrowseWaiterOp,
}

/// One batch of SDP results for a single searched UUID
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdpBatch {
    /// Service class UUIDs found in the returned records
    pub uuids: Vec<ServiceUuid, MAX_UUIDS>,
    /// Device-ID quad when the PnP record was among the results
    pub device_id: Option<DeviceId>,
    /// GATT-over-BR/EDR primaries advertised via SDP
    pub primaries: Vec<GattPrimary, MAX_PRIMARIES>,
}

/// Accumulated outcome of a completed browse
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowseOutcome {
    /// Resolved service UUIDs to merge into the device
    pub uuids: Vec<ServiceUuid, MAX_UUIDS>,
    /// Primary GATT services
    pub primaries: Vec<GattPrimary, MAX_PRIMARIES>,
    /// Device-ID quad when discovered
    pub device_id: Option<DeviceId>,
}

/// The one in-flight discovery of a device
#[derive(Debug)]
pub struct BrowseRequest {
    /// Discovery mechanism
    pub kind: BrowseKind,
    /// Bearer the discovery runs on
    pub bearer: BearerType,
    /// Parked caller, if any
    pub waiter: Option<BrowseWaiter>,
    /// Position in the mandatory SDP search sequence
    search_index: usize,
    /// Accumulated results
    outcome: BrowseOutcome,
    /// Set once cancellation was requested
    canceled: bool,
}

impl BrowseRequest {
    /// Start an SDP browse
    #[must_use]
    pub fn sdp(waiter: Option<BrowseWaiter>) -> Self {
        Self {
            kind: BrowseKind::Sdp,
            bearer: BearerType::BrEdr,
            waiter,
            search_index: 0,
            outcome: BrowseOutcome::default(),
            canceled: false,
        }
    }

    /// Start a GATT browse
    #[must_use]
    pub fn gatt(waiter: Option<BrowseWaiter>) -> Self {
        Self {
            kind: BrowseKind::Gatt,
            bearer: BearerType::Le,
            waiter,
            search_index: 0,
            outcome: BrowseOutcome::default(),
            canceled: false,
        }
    }

    /// The UUID the SDP walk should search next, advancing the cursor
    ///
    /// Returns `None` once the mandatory list is exhausted or the browse
    /// was canceled.
    pub fn next_sdp_target(&mut self) -> Option<ServiceUuid> {
        if self.kind != BrowseKind::Sdp || self.canceled {
            return None;
        }
        let target = SDP_BROWSE_ORDER.get(self.search_index)?;
        self.search_index += 1;
        Some(*target)
    }

    /// Merge one batch of SDP results
    pub fn record_sdp_batch(&mut self, batch: &SdpBatch) {
        for uuid in &batch.uuids {
            if !self.outcome.uuids.contains(uuid) {
                self.outcome.uuids.push(*uuid).ok();
            }
        }
        for primary in &batch.primaries {
            if !self.outcome.primaries.contains(primary) {
                self.outcome.primaries.push(*primary).ok();
            }
        }
        if batch.device_id.is_some() {
            self.outcome.device_id = batch.device_id;
        }
    }

    /// Record the primaries delivered by a ready GATT client
    pub fn record_gatt_primaries(&mut self, primaries: &[GattPrimary]) {
        for primary in primaries {
            if !self.outcome.primaries.contains(primary) {
                self.outcome.primaries.push(*primary).ok();
            }
            if !self.outcome.uuids.contains(&primary.uuid) {
                self.outcome.uuids.push(primary.uuid).ok();
            }
        }
    }

    /// Mark the browse canceled; completion will report `Canceled`
    pub fn cancel(&mut self) {
        self.canceled = true;
    }

    /// Whether cancellation was requested
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Take the accumulated outcome
    #[must_use]
    pub fn into_outcome(self) -> BrowseOutcome {
        self.outcome
    }

    /// Peek at the accumulated outcome
    #[must_use]
    pub fn outcome(&self) -> &BrowseOutcome {
        &self.outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid::{UUID_AUDIO_SINK, UUID_AUDIO_SOURCE, UUID_L2CAP, UUID_PNP_INFO, UUID_PUBLIC_BROWSE};

    #[test]
    fn test_sdp_walks_mandatory_list_in_order() {
        let mut req = BrowseRequest::sdp(None);
        assert_eq!(req.next_sdp_target(), Some(UUID_L2CAP));
        assert_eq!(req.next_sdp_target(), Some(UUID_PNP_INFO));
        assert_eq!(req.next_sdp_target(), Some(UUID_PUBLIC_BROWSE));
        assert_eq!(req.next_sdp_target(), None);
    }

    #[test]
    fn test_cancel_stops_the_walk() {
        let mut req = BrowseRequest::sdp(None);
        assert!(req.next_sdp_target().is_some());
        req.cancel();
        assert!(req.is_canceled());
        assert_eq!(req.next_sdp_target(), None);
    }

    #[test]
    fn test_batches_accumulate_without_duplicates() {
        let mut req = BrowseRequest::sdp(None);

        let mut batch = SdpBatch::default();
        batch.uuids.push(UUID_AUDIO_SINK).unwrap();
        batch.uuids.push(UUID_AUDIO_SOURCE).unwrap();
        req.record_sdp_batch(&batch);

        let mut batch2 = SdpBatch::default();
        batch2.uuids.push(UUID_AUDIO_SINK).unwrap();
        batch2.device_id = Some(DeviceId {
            source: 1,
            vendor: 0x1234,
            product: 0x5678,
            version: 1,
        });
        req.record_sdp_batch(&batch2);

        let outcome = req.into_outcome();
        assert_eq!(outcome.uuids.len(), 2);
        assert_eq!(outcome.device_id.unwrap().vendor, 0x1234);
    }

    #[test]
    fn test_gatt_primaries_imply_uuids() {
        let mut req = BrowseRequest::gatt(None);
        let primary = GattPrimary {
            uuid: UUID_AUDIO_SINK,
            start_handle: 0x0010,
            end_handle: 0x001F,
        };
        req.record_gatt_primaries(&[primary, primary]);

        let outcome = req.into_outcome();
        assert_eq!(outcome.primaries.len(), 1);
        assert_eq!(outcome.uuids.as_slice(), &[UUID_AUDIO_SINK]);
    }

    #[test]
    fn test_waiter_survives_the_walk() {
        let waiter = BrowseWaiter {
            id: RequestId(7),
            op: BrowseWaiterOp::Connect,
        };
        let mut req = BrowseRequest::sdp(Some(waiter));
        while req.next_sdp_target().is_some() {}
        assert_eq!(req.waiter, Some(waiter));
    }
}
