//! Processor entry points
//!
//! Glue between the channels and the registry. The embedding stack calls
//! [`handle_event`] from its management/transport glue, spawns
//! [`request_processor`] next to its executor and consumes
//! [`crate::COMMAND_CHANNEL`] to execute outbound commands.
//!
//! The registry mutex is held only while state is mutated; queued side
//! effects are forwarded after it is released so command consumers can
//! call back into the API without deadlocking.

use embassy_time::Instant;

use crate::{
    COMMAND_CHANNEL, Command, DeviceError, DeviceEvent, Outbox, RESPONSE_CHANNEL, REQUEST_CHANNEL,
    Response, with_registry,
};

async fn dispatch(mut outbox: Outbox) {
    for command in outbox.take_commands() {
        match command {
            Command::Reply { id, result } => {
                RESPONSE_CHANNEL.send(Response::Complete { id, result }).await;
            }
            other => COMMAND_CHANNEL.send(other).await,
        }
    }
    for (addr, property) in outbox.take_changes() {
        COMMAND_CHANNEL
            .send(Command::PropertyChanged { addr, property })
            .await;
    }
}

/// Apply one collaborator event to the registry
///
/// # Errors
///
/// Returns [`DeviceError::NotReady`] before [`crate::init_registry`] ran.
pub async fn handle_event(event: DeviceEvent, now: Instant) -> Result<(), DeviceError> {
    let outbox = with_registry(|registry| {
        registry.handle_event(event, now);
        registry.drain_outbox()
    })
    .await?;

    dispatch(outbox).await;
    Ok(())
}

/// Fire due timers and flush debounced storage writes
///
/// Call this periodically (a few times per second is plenty).
///
/// # Errors
///
/// Returns [`DeviceError::NotReady`] before [`crate::init_registry`] ran.
pub async fn tick(now: Instant) -> Result<(), DeviceError> {
    let outbox = with_registry(|registry| {
        registry.tick(now);
        registry.drain_outbox()
    })
    .await?;

    dispatch(outbox).await;
    Ok(())
}

/// API request processor
///
/// Drains the request channel forever; spawn it once next to the event
/// glue. Immediate results answer right away, parked operations reply
/// later through their [`Command::Reply`] completions.
pub async fn request_processor() -> ! {
    loop {
        let request = REQUEST_CHANNEL.receive().await;
        let id = request.id;
        defmt::debug!("processing api request");

        let now = Instant::now();
        let result = with_registry(|registry| {
            let response = registry.process_request(request, now);
            (response, registry.drain_outbox())
        })
        .await;

        match result {
            Ok((response, outbox)) => {
                dispatch(outbox).await;
                if let Some(response) = response {
                    RESPONSE_CHANNEL.send(response).await;
                }
            }
            Err(e) => {
                RESPONSE_CHANNEL
                    .send(Response::Complete {
                        id,
                        result: Err(e),
                    })
                    .await;
            }
        }
    }
}
