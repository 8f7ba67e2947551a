use std::sync::Arc;

use serde::Serialize;

use super::connection::{Frame, Outbox};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Serializes `message` once and offers the frame to every outbox without
/// waiting. A full or closed outbox loses the frame; nobody else notices.
///
/// Serialization failure delivers nothing.
pub fn fan_out<'a, M, I>(message: &M, outboxes: I) -> Result<Delivery, serde_json::Error>
where
    M: Serialize + ?Sized,
    I: IntoIterator<Item = &'a Outbox>,
{
    let frame: Frame = serde_json::to_string(message)?.into();

    let mut delivery = Delivery::default();
    for outbox in outboxes {
        if outbox.try_push(Arc::clone(&frame)) {
            delivery.delivered += 1;
        } else {
            delivery.dropped += 1;
        }
    }

    Ok(delivery)
}
