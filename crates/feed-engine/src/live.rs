use std::sync::Arc;

use feed_core::{
    ConnectionStateMachine, FeedError, PushChannel, PushEvent, PushFrame, PushSubscription,
    RetryPolicy, Scope,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::signal::{LiveSignal, Signal, SignalSink};

/// Running live channel task for one scope.
#[derive(Debug)]
pub(crate) struct LiveChannelHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveChannelHandle {
    /// Unsubscribe and stop reconnecting.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn stop_and_join(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the subscribe/reconnect loop for `scope`.
///
/// The task walks the connection state machine, forwards decoded inserts,
/// drops malformed frames, and on every entry into `Live` asks for a backfill
/// of the latest page, since events published while unsubscribed are lost.
pub(crate) fn spawn_live_channel(
    push: Arc<dyn PushChannel>,
    scope: Scope,
    policy: RetryPolicy,
    stop: CancellationToken,
    sink: SignalSink,
) -> LiveChannelHandle {
    let task = tokio::spawn(run_live_channel(push, scope, policy, stop.clone(), sink));
    LiveChannelHandle { stop, task }
}

async fn run_live_channel(
    push: Arc<dyn PushChannel>,
    scope: Scope,
    policy: RetryPolicy,
    stop: CancellationToken,
    sink: SignalSink,
) {
    let mut machine = ConnectionStateMachine::default();
    let mut attempt: u32 = 0;

    if let Ok(status) = machine.on_connect()
        && !sink.emit(Signal::Live(LiveSignal::Status(status))).await
    {
        return;
    }

    loop {
        let subscribed = tokio::select! {
            _ = stop.cancelled() => break,
            result = push.subscribe(&scope) => result,
        };

        let retry_after_hint_ms = match subscribed {
            Ok(mut subscription) => {
                let entry = match machine.on_connected() {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!(%scope, code = %err.code, "live channel state machine rejected connect");
                        break;
                    }
                };
                attempt = 0;
                info!(%scope, reconnect = entry.reconnect, "live channel connected");
                if !sink.emit(Signal::Live(LiveSignal::Status(machine.state()))).await
                    || !sink
                        .emit(Signal::Live(LiveSignal::BackfillNeeded {
                            reconnect: entry.reconnect,
                        }))
                        .await
                {
                    break;
                }

                let lost = pump_frames(&mut subscription, &scope, &stop, &sink).await;
                subscription.unsubscribe();
                let Some(reason) = lost else {
                    break;
                };
                warn!(%scope, %reason, "push transport lost");
                None
            }
            Err(err) => {
                warn!(%scope, code = %err.code, message = %err.message, attempt, "push subscribe failed");
                err.retry_after_ms
            }
        };

        match machine.on_transport_lost() {
            Ok(Some(status)) => {
                if !sink.emit(Signal::Live(LiveSignal::Status(status))).await {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%scope, code = %err.code, "live channel state machine rejected transport loss");
                break;
            }
        }

        let delay = policy.jittered_delay_for_attempt(
            attempt,
            retry_after_hint_ms,
            &mut rand::thread_rng(),
        );
        attempt = attempt.saturating_add(1);
        debug!(%scope, attempt, delay_ms = delay.as_millis() as u64, "scheduling push reconnect");

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    if let Some(status) = machine.on_closed() {
        let _ = sink.emit(Signal::Live(LiveSignal::Status(status))).await;
    }
    debug!(%scope, "live channel stopped");
}

/// Forward frames until the transport drops (`Some(reason)`) or the channel
/// is stopped (`None`).
async fn pump_frames(
    subscription: &mut PushSubscription,
    scope: &Scope,
    stop: &CancellationToken,
    sink: &SignalSink,
) -> Option<String> {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return None,
            frame = subscription.next_frame() => frame,
        };

        let raw = match frame {
            None => return Some("push stream closed".to_owned()),
            Some(PushFrame::TransportLost { reason }) => return Some(reason),
            Some(PushFrame::Event(raw)) => raw,
        };

        match decode_push_event(raw) {
            Ok(PushEvent::Insert { message }) => {
                trace!(%scope, id = %message.id, "live insert");
                if !sink.emit(Signal::Live(LiveSignal::Insert(message))).await {
                    return None;
                }
            }
            Ok(PushEvent::Update { message }) => {
                debug!(%scope, id = %message.id, "ignoring reserved update event");
            }
            Ok(PushEvent::Delete { id }) => {
                debug!(%scope, %id, "ignoring reserved delete event");
            }
            Err(err) => {
                warn!(%scope, code = %err.code, message = %err.message, "dropping malformed push event");
            }
        }
    }
}

/// Decode a raw push payload; failures are protocol errors.
pub fn decode_push_event(raw: serde_json::Value) -> Result<PushEvent, FeedError> {
    serde_json::from_value(raw).map_err(|err| FeedError::protocol(err.to_string()))
}
