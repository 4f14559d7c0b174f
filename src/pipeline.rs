use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::hub::{Hub, Payload};
use crate::protocol::{self, RawFrame};

/// Drain frames from the connection machine, decode them and publish the
/// results. Runs until the frame queue closes. Frames are handled strictly
/// in arrival order.
pub async fn run(mut frames: mpsc::Receiver<RawFrame>, hub: Arc<Hub>) {
    while let Some(frame) = frames.recv().await {
        match protocol::decode(&frame) {
            Ok(event) => {
                hub.health().record_decoded();
                debug!(
                    "{:?} from {}: {:?}",
                    event.kind(),
                    event.device_id,
                    event.message
                );
                let queued = hub.publish(Payload::Decoded(event));
                debug!("Event queued for {queued} subscriber(s)");
            }
            Err(err) => {
                hub.health().record_decode_error();
                warn!(
                    "Failed to decode frame {} from {}: {err}",
                    protocol::to_hex(&frame.bytes),
                    frame.device_id
                );
            }
        }
    }
    info!("Frame pipeline closed");
}
