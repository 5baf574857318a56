//! Public API functions
//!
//! Channel-backed helpers for application code: each sends one request to
//! the processor and waits for the matching response. Responses are
//! matched by token, but the channel has a single consumer, so serialize
//! calls at the application level rather than racing them from multiple
//! tasks.

use core::sync::atomic::{AtomicU32, Ordering};

use heapless::String;

use crate::{
    DeviceAddress, DeviceError, PreferredBearer, REQUEST_CHANNEL, RESPONSE_CHANNEL, Request,
    RequestId, RequestOp, Response, bonding::IoCapability, constants::MAX_NAME_LENGTH,
    registry::DeviceSnapshot, uuid::ServiceUuid,
};

static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

fn next_id() -> RequestId {
    RequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

async fn submit(op: RequestOp) -> RequestId {
    let id = next_id();
    REQUEST_CHANNEL.send(Request { id, op }).await;
    id
}

async fn await_complete(id: RequestId) -> Result<(), DeviceError> {
    loop {
        match RESPONSE_CHANNEL.receive().await {
            Response::Complete { id: rid, result } if rid == id => return result,
            _ => {}
        }
    }
}

/// Pair with a device using a just-works agent
///
/// # Errors
///
/// `InProgress` while another bonding or connect runs, `AlreadyExists`
/// when the selected bearer is bonded, pairing-outcome errors otherwise.
pub async fn pair_device(addr: DeviceAddress) -> Result<(), DeviceError> {
    pair_device_with_agent(addr, IoCapability::NoInputNoOutput).await
}

/// Pair with a device announcing the given agent capability
///
/// # Errors
///
/// Same as [`pair_device`].
pub async fn pair_device_with_agent(
    addr: DeviceAddress,
    io_cap: IoCapability,
) -> Result<(), DeviceError> {
    let id = submit(RequestOp::Pair {
        addr,
        io_cap,
        agent_present: true,
    })
    .await;
    await_complete(id).await
}

/// Cancel an in-flight pairing, or remove stored bonding material
///
/// # Errors
///
/// `DoesNotExist` when nothing was in flight.
pub async fn cancel_pairing(addr: DeviceAddress) -> Result<(), DeviceError> {
    let id = submit(RequestOp::CancelPairing { addr }).await;
    await_complete(id).await
}

/// Connect the device on its best bearer
///
/// # Errors
///
/// `InProgress`, `NotReady`, `ProfileUnavailable` or a bearer-tagged
/// connection error.
pub async fn connect_device(addr: DeviceAddress) -> Result<(), DeviceError> {
    let id = submit(RequestOp::Connect { addr }).await;
    await_complete(id).await
}

/// Connect exactly one profile by UUID
///
/// # Errors
///
/// Same as [`connect_device`], plus `DoesNotExist` for unknown UUIDs.
pub async fn connect_profile(
    addr: DeviceAddress,
    uuid: ServiceUuid,
) -> Result<(), DeviceError> {
    let id = submit(RequestOp::ConnectProfile { addr, uuid }).await;
    await_complete(id).await
}

/// Disconnect the device, both bearers included
///
/// # Errors
///
/// `DoesNotExist` for unknown devices.
pub async fn disconnect_device(addr: DeviceAddress) -> Result<(), DeviceError> {
    let id = submit(RequestOp::Disconnect { addr }).await;
    await_complete(id).await
}

/// Disconnect exactly one profile by UUID
///
/// # Errors
///
/// `DoesNotExist` for unknown devices or UUIDs.
pub async fn disconnect_profile(
    addr: DeviceAddress,
    uuid: ServiceUuid,
) -> Result<(), DeviceError> {
    let id = submit(RequestOp::DisconnectProfile { addr, uuid }).await;
    await_complete(id).await
}

/// Block the device: force-disconnect and reject future connections
///
/// # Errors
///
/// `DoesNotExist` for unknown devices.
pub async fn block_device(addr: DeviceAddress) -> Result<(), DeviceError> {
    let id = submit(RequestOp::Block { addr }).await;
    await_complete(id).await
}

/// Unblock the device and re-probe its profiles
///
/// # Errors
///
/// `DoesNotExist` for unknown devices.
pub async fn unblock_device(addr: DeviceAddress) -> Result<(), DeviceError> {
    let id = submit(RequestOp::Unblock { addr }).await;
    await_complete(id).await
}

/// Set the Trusted property
///
/// # Errors
///
/// `DoesNotExist` for unknown devices.
pub async fn set_device_trusted(addr: DeviceAddress, trusted: bool) -> Result<(), DeviceError> {
    let id = submit(RequestOp::SetTrusted { addr, trusted }).await;
    await_complete(id).await
}

/// Set the Alias property; an empty alias reverts to the remote name
///
/// # Errors
///
/// `InvalidArguments` for over-long aliases, `DoesNotExist` for unknown
/// devices.
pub async fn set_device_alias(addr: DeviceAddress, alias: &str) -> Result<(), DeviceError> {
    let mut value: String<MAX_NAME_LENGTH> = String::new();
    value
        .push_str(alias)
        .map_err(|()| DeviceError::InvalidArguments)?;
    let id = submit(RequestOp::SetAlias { addr, alias: value }).await;
    await_complete(id).await
}

/// Set the WakeAllowed property
///
/// # Errors
///
/// `Unsupported` for temporary or wake-incapable devices.
pub async fn set_wake_allowed(addr: DeviceAddress, allowed: bool) -> Result<(), DeviceError> {
    let id = submit(RequestOp::SetWakeAllowed { addr, allowed }).await;
    await_complete(id).await
}

/// Set the PreferredBearer property
///
/// # Errors
///
/// `NotSupported` for single-bearer devices.
pub async fn set_preferred_bearer(
    addr: DeviceAddress,
    prefer: PreferredBearer,
) -> Result<(), DeviceError> {
    let id = submit(RequestOp::SetPreferredBearer { addr, prefer }).await;
    await_complete(id).await
}

/// Remove the device, optionally deleting its stored state
///
/// # Errors
///
/// `DoesNotExist` for unknown devices.
pub async fn remove_device(addr: DeviceAddress, remove_stored: bool) -> Result<(), DeviceError> {
    let id = submit(RequestOp::RemoveDevice {
        addr,
        remove_stored,
    })
    .await;
    await_complete(id).await
}

/// Read a snapshot of the device's observable properties
///
/// # Errors
///
/// `DoesNotExist` for unknown devices.
pub async fn get_device(addr: DeviceAddress) -> Result<DeviceSnapshot, DeviceError> {
    let id = submit(RequestOp::GetDevice { addr }).await;
    loop {
        match RESPONSE_CHANNEL.receive().await {
            Response::Device { id: rid, result } if rid == id => return result,
            Response::Complete { id: rid, result } if rid == id => {
                return result.and(Err(DeviceError::DoesNotExist));
            }
            _ => {}
        }
    }
}
