//! Waiting for a Velero resource to reach a terminal phase
//!
//! A background task owns the watch subscription and forwards events into a
//! bounded channel. The caller consumes the channel until the named resource
//! reports a terminal phase, the subscription closes, or it is cancelled.
//! Objects delivered by the initial list are considered too, so a resource
//! that finished before the watch started is not waited on forever.

use futures::StreamExt;
use kube::api::{Api, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devenv_common::{Error, Result};

use crate::velero::Phase;

/// Events buffered between the watch task and the waiter
const EVENT_BUFFER: usize = 16;

/// Watch `name` through `api` until it reaches a terminal phase.
///
/// Returns the terminal phase. Fails with `WatchClosed` if the subscription
/// ends first, `ResourceDeleted` if the object disappears while in flight,
/// and `Cancelled` if the token fires.
pub async fn wait_for_terminal_phase(
    api: Api<DynamicObject>,
    kind: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<Phase> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let config = watcher::Config::default().fields(&format!("metadata.name={}", name));

    let watch_kind = kind.to_string();
    let producer = tokio::spawn(async move {
        let mut stream = watcher::watcher(api, config).default_backoff().boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!(kind = %watch_kind, "Phase waiter gone, stopping watch");
                        break;
                    }
                }
                Err(e) => warn!(kind = %watch_kind, error = %e, "Watch error, backing off"),
            }
        }
    });

    let result = consume_phase_events(rx, kind, name, cancel).await;
    producer.abort();
    result
}

/// Consume watch events for `name` until a terminal phase is observed.
pub async fn consume_phase_events(
    mut events: mpsc::Receiver<Event<DynamicObject>>,
    kind: &str,
    name: &str,
    cancel: &CancellationToken,
) -> Result<Phase> {
    let mut last = Phase::New;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {} {}", kind, name)));
            }
            event = events.recv() => event,
        };

        let Some(event) = event else {
            return Err(Error::WatchClosed {
                kind: kind.to_string(),
                name: name.to_string(),
            });
        };

        match event {
            Event::Apply(obj) | Event::InitApply(obj) => {
                if obj.metadata.name.as_deref() != Some(name) {
                    continue;
                }
                let phase = Phase::from_value(&obj.data);
                if phase != last {
                    info!(kind = %kind, name = %name, phase = %phase, "Phase changed");
                }
                if phase.is_terminal() {
                    return Ok(phase);
                }
                last = phase;
            }
            Event::Delete(obj) => {
                if obj.metadata.name.as_deref() != Some(name) {
                    continue;
                }
                let phase = Phase::from_value(&obj.data);
                if phase.is_terminal() {
                    return Ok(phase);
                }
                return Err(Error::ResourceDeleted {
                    kind: kind.to_string(),
                    name: name.to_string(),
                    phase: phase.to_string(),
                });
            }
            Event::Init | Event::InitDone => {}
        }
    }
}
