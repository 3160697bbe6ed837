//! Local delivery path: write a verified message straight to a recipient's socket.

use std::time::Duration;

use crate::connection::ConnectionHandle;
use crate::envelope::DeliveredMessage;
use crate::error::DeliveryError;
use crate::identity::PeerId;

/// Default upper bound for one delivery write
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Build the outgoing frame and write it to `to`, giving up after `write_timeout`.
///
/// Failures are returned as-is; nothing here retries or falls back. A
/// recipient that stops draining its socket costs the caller at most one
/// `write_timeout`.
pub async fn deliver_local(
    from: PeerId,
    from_name: &str,
    to: &ConnectionHandle,
    from_nonce: u64,
    encrypted: bool,
    msg: &[Vec<u8>],
    write_timeout: Duration,
) -> Result<(), DeliveryError> {
    if to.is_closed() {
        return Err(DeliveryError::Closed);
    }

    let frame = DeliveredMessage {
        from_id: from,
        from_name: from_name.to_string(),
        from_nonce,
        encrypted,
        msg: msg.to_vec(),
    };
    let text = serde_json::to_string(&frame).map_err(|e| DeliveryError::Encode(e.to_string()))?;

    tokio::time::timeout(write_timeout, to.send_text(text))
        .await
        .map_err(|_| DeliveryError::Timeout {
            timeout_ms: write_timeout.as_millis() as u64,
        })?
}
