//! Publishing typed values.

use serde::Serialize;
use tracing::debug;
use warren_codec::{BincodeCodec, Codec, JsonCodec};
use warren_transport::Channel;

use crate::PubSubError;

/// Publishes `value` as JSON.
///
/// This is the format used for state messages such as pause/resume.
/// Subscribers must decode with [`JsonCodec`]; use [`publish_with`] to
/// pick another codec.
pub async fn publish<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    T: Serialize + Sync + ?Sized,
{
    publish_with(channel, &JsonCodec, exchange, routing_key, value).await
}

/// Publishes `value` as JSON. Same as [`publish`].
pub async fn publish_json<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    T: Serialize + Sync + ?Sized,
{
    publish_with(channel, &JsonCodec, exchange, routing_key, value).await
}

/// Publishes `value` in the compact binary format.
pub async fn publish_bincode<Ch, T>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    T: Serialize + Sync + ?Sized,
{
    publish_with(channel, &BincodeCodec, exchange, routing_key, value).await
}

/// Encodes `value` with `codec` and publishes it to `exchange`.
///
/// Fire-and-forget: there are no publisher confirms, and an unroutable
/// message is silently dropped by the broker.
///
/// # Errors
/// - [`PubSubError::EncodingFailed`] if `value` cannot be encoded; the
///   transport is not called
/// - [`PubSubError::Transport`] with the transport's error as-is
pub async fn publish_with<Ch, K, T>(
    channel: &Ch,
    codec: &K,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<(), PubSubError>
where
    Ch: Channel,
    K: Codec,
    T: Serialize + Sync + ?Sized,
{
    let payload = codec.encode(value).map_err(PubSubError::EncodingFailed)?;

    channel
        .publish(exchange, routing_key, codec.content_type(), &payload)
        .await?;

    debug!(
        exchange,
        routing_key,
        content_type = codec.content_type(),
        bytes = payload.len(),
        "message published"
    );
    Ok(())
}
