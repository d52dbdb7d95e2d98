//! Server-sent event endpoints over the stream bus.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use super::error::ApiError;
use super::routes::AppState;
use crate::bus::{BusEvent, ChannelId, EventStream, StreamBus};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeQuery {
    pub last_seen_id: Option<u64>,
}

/// Resume point: `lastSeenId` query wins over the `Last-Event-ID` header.
fn last_seen(query: &ResumeQuery, headers: &HeaderMap) -> Option<u64> {
    query.last_seen_id.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

fn to_sse(event: &BusEvent) -> Event {
    let sse = Event::default()
        .id(event.id.to_string())
        .event(event.payload.kind());
    match sse.json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            warn!(event_id = event.id, error = %e, "Failed to encode event");
            Event::default().id(event.id.to_string()).comment("encode error")
        }
    }
}

fn into_sse(events: EventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>> + use<>> {
    let stream = events.map(|event| Ok(to_sse(&event)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE))
}

async fn subscribe(state: &AppState, channel: ChannelId, last_seen: Option<u64>) -> EventStream {
    debug!(%channel, ?last_seen, "SSE subscriber attached");
    state.orchestrator.bus().subscribe(&channel, last_seen).await
}

/// `GET /streams/run/{id}`
///
/// Unknown runs are a 404. A finished run whose channel was already pruned
/// gets its close marker only.
pub async fn run_stream(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run = state.orchestrator.db().get_run(&run_id).await?;
    let channel = ChannelId::Run(run_id);
    let events = if run.finished_at.is_some() && !state.orchestrator.bus().exists(&channel).await {
        debug!(%channel, "Run channel already pruned");
        StreamBus::closed_stream(&channel, run.state.as_str())
    } else {
        subscribe(&state, channel, last_seen(&query, &headers)).await
    };
    Ok(into_sse(events))
}

/// `GET /streams/thread/{id}`
pub async fn thread_stream(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    into_sse(subscribe(&state, ChannelId::Thread(thread_id), last_seen(&query, &headers)).await)
}

/// `GET /streams/feed`
pub async fn feed_stream(
    State(state): State<AppState>,
    Query(query): Query<ResumeQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    into_sse(subscribe(&state, ChannelId::Feed, last_seen(&query, &headers)).await)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn query_takes_precedence_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert("last-event-id", "7".parse().unwrap());
        let none = ResumeQuery::default();
        assert_eq!(last_seen(&none, &headers), Some(7));
        let query = ResumeQuery {
            last_seen_id: Some(3),
        };
        assert_eq!(last_seen(&query, &headers), Some(3));
        assert_eq!(last_seen(&none, &HeaderMap::new()), None);
    }
}
