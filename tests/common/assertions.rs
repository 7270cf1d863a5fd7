//! Assertions over the aggregator's event stream

use std::time::Duration;

use tokio::time::{timeout, Instant};

use fleetlink::{LogLevel, ServerEvent};

use super::harness::{Events, WAIT};

/// Skip events until one satisfies `matches`; panics after [`WAIT`].
pub async fn expect_event(events: &mut Events, matches: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    let deadline = Instant::now() + WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(event)) if matches(&event) => return event,
            Ok(Some(_)) => {}
            Ok(None) => panic!("event stream closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Wait for the next `ConnectionOpened` and return its id
pub async fn expect_opened(events: &mut Events) -> String {
    match expect_event(events, |e| matches!(e, ServerEvent::ConnectionOpened { .. })).await {
        ServerEvent::ConnectionOpened { id, .. } => id,
        _ => unreachable!(),
    }
}

pub async fn expect_closed_event(events: &mut Events, id: &str) {
    expect_event(events, |e| matches!(e, ServerEvent::ConnectionClosed { id: closed } if closed == id)).await;
}

pub async fn expect_log(events: &mut Events, level: LogLevel, needle: &str) -> String {
    match expect_event(events, |e| {
        matches!(e, ServerEvent::Log { level: l, text } if *l == level && text.contains(needle))
    })
    .await
    {
        ServerEvent::Log { text, .. } => text,
        _ => unreachable!(),
    }
}

/// Collect every event that arrives until the stream has been idle for `idle`.
///
/// Panics if it never goes idle within [`WAIT`].
pub async fn drain_until_idle(events: &mut Events, idle: Duration) -> Vec<ServerEvent> {
    let deadline = Instant::now() + WAIT;
    let mut seen = Vec::new();
    loop {
        assert!(Instant::now() < deadline, "event stream never went idle");
        match timeout(idle, events.recv()).await {
            Ok(Some(event)) => seen.push(event),
            Ok(None) | Err(_) => return seen,
        }
    }
}
