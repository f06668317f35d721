//! SSE (Server-Sent Events) streaming of analytics reports.
//!
//! Each analytics cycle publishes a report on a watch channel; subscribers
//! get the latest report first and then one event per cycle.

use axum::response::sse::Event;
use futures::stream::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

use crate::cache::store::AnalyticsReport;

/// Convert an analytics receiver into an SSE stream of JSON `analytics` events.
pub fn analytics_to_sse_stream(
    rx: watch::Receiver<AnalyticsReport>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    WatchStream::new(rx).map(|report| {
        let data = serde_json::to_string(&report).unwrap_or_default();
        Ok(Event::default().event("analytics").data(data))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_yields_current_then_updates() {
        let (tx, rx) = watch::channel(AnalyticsReport::default());
        let mut stream = Box::pin(analytics_to_sse_stream(rx));

        assert!(stream.next().await.is_some());

        tx.send_replace(AnalyticsReport {
            item_count: 5,
            ..Default::default()
        });
        assert!(stream.next().await.is_some());

        drop(tx);
        assert!(stream.next().await.is_none());
    }
}
