//! Read-once waker: wait for the peer to send anything or disconnect.

use futures_util::{Stream, StreamExt};

/// Wait for the next item from the stream and discard it. Completion on
/// data, close, or error alike signals that the peer did something; the
/// caller races this against its other wake conditions.
pub async fn read_once<S>(stream: &mut S)
where
    S: Stream + Unpin,
{
    let _ = stream.next().await;
}
