//! Adapter from host tab notifications to tracker transitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::host::{TabEvent, TabEventSource, TabHost};
use crate::tracker::Tracker;

/// Requests answered by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum StatusRequest {
    GetTrackingStatus,
}

/// Response to [`StatusRequest::GetTrackingStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub is_tracking: bool,
}

/// Maps host notifications onto a [`Tracker`].
#[derive(Clone)]
pub struct TabEventListener {
    tracker: Arc<Tracker>,
    host: Arc<dyn TabHost>,
}

impl std::fmt::Debug for TabEventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TabEventListener")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl TabEventListener {
    pub fn new(tracker: Arc<Tracker>, host: Arc<dyn TabHost>) -> Self {
        Self { tracker, host }
    }

    /// Handles notifications until the source closes.
    pub async fn run<S: TabEventSource>(&self, mut source: S) {
        while let Some(event) = source.next_event().await {
            self.handle(event).await;
        }
        debug!("tab event source closed");
    }

    /// Applies a single notification.
    ///
    /// Nothing happens while tracking is off; notifications are dropped, not
    /// queued.
    pub async fn handle(&self, event: TabEvent) {
        if !self.tracker.is_tracking() {
            return;
        }
        match event {
            TabEvent::Activated { tab_id } => match self.host.tab(tab_id).await {
                Ok(Some(tab)) => self.tracker.activate(tab.id, &tab.url).await,
                // An unresolved lookup counts as the tab closing.
                Ok(None) => {
                    debug!(%tab_id, "activated tab vanished before lookup");
                    self.tracker.deactivate_on_close(tab_id).await;
                }
                Err(e) => {
                    warn!(%tab_id, error = %e, "tab lookup failed");
                    self.tracker.deactivate_on_close(tab_id).await;
                }
            },
            TabEvent::Updated {
                tab_id,
                url: Some(url),
            } => self.tracker.navigate(tab_id, &url).await,
            TabEvent::Updated { url: None, .. } => {}
            TabEvent::Removed { tab_id } => self.tracker.deactivate_on_close(tab_id).await,
        }
    }

    /// Answers a status request without waiting on the tracker.
    pub fn respond(&self, request: StatusRequest) -> TrackingStatus {
        match request {
            StatusRequest::GetTrackingStatus => TrackingStatus {
                is_tracking: self.tracker.is_tracking(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use tokio::sync::mpsc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::host::{HostError, Tab, TabMirror};
    use crate::store::MemoryStore;
    use crate::types::{DomainKey, TabId};

    struct Fixture {
        listener: TabEventListener,
        tracker: Arc<Tracker>,
        host: Arc<TabMirror>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        ));
        let host = Arc::new(TabMirror::new());
        let tracker = Arc::new(Tracker::new(
            Arc::new(MemoryStore::new()),
            host.clone(),
            clock.clone(),
        ));
        let listener = TabEventListener::new(tracker.clone(), host.clone());
        Fixture {
            listener,
            tracker,
            host,
            clock,
        }
    }

    async fn current_domain(tracker: &Tracker) -> Option<String> {
        tracker
            .attribution()
            .await
            .domain
            .map(|d: DomainKey| d.to_string())
    }

    #[tokio::test]
    async fn test_activation_looks_up_url() {
        let f = fixture();
        f.host.upsert(TabId(4), "https://news.ycombinator.com/item?id=1");

        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(4) })
            .await;

        assert_eq!(
            current_domain(&f.tracker).await,
            Some("news.ycombinator.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_update_with_url_navigates_tracked_tab() {
        let f = fixture();
        f.host.upsert(TabId(1), "https://a.com");
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;

        f.clock.advance(Duration::seconds(2));
        f.listener
            .handle(TabEvent::Updated {
                tab_id: TabId(1),
                url: Some("https://b.com/".to_string()),
            })
            .await;
        f.clock.advance(Duration::seconds(3));
        f.tracker.tick().await;

        let totals = f.tracker.totals().await.unwrap();
        assert_eq!(totals.get("a.com"), Some(2.0));
        assert_eq!(totals.get("b.com"), Some(3.0));
    }

    #[tokio::test]
    async fn test_update_without_url_is_ignored() {
        let f = fixture();
        f.host.upsert(TabId(1), "https://a.com");
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;
        let before = f.tracker.attribution().await;

        f.clock.advance(Duration::seconds(1));
        f.listener
            .handle(TabEvent::Updated {
                tab_id: TabId(1),
                url: None,
            })
            .await;

        assert_eq!(f.tracker.attribution().await, before);
    }

    #[tokio::test]
    async fn test_removal_of_tracked_tab_goes_idle() {
        let f = fixture();
        f.host.upsert(TabId(1), "https://a.com");
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;

        f.listener
            .handle(TabEvent::Removed { tab_id: TabId(1) })
            .await;

        assert!(f.tracker.attribution().await.is_idle());
    }

    #[tokio::test]
    async fn test_vanished_other_tab_keeps_attribution() {
        let f = fixture();
        f.host.upsert(TabId(1), "https://a.com");
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;

        f.clock.advance(Duration::seconds(4));
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(99) })
            .await;
        f.clock.advance(Duration::seconds(2));
        f.tracker.tick().await;

        assert_eq!(current_domain(&f.tracker).await, Some("a.com".to_string()));
        assert_eq!(f.tracker.totals().await.unwrap().get("a.com"), Some(6.0));
    }

    #[tokio::test]
    async fn test_vanished_tracked_tab_settles_and_goes_idle() {
        let f = fixture();
        f.host.upsert(TabId(1), "https://a.com");
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;

        f.clock.advance(Duration::seconds(4));
        f.host.remove(TabId(1));
        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;

        assert!(f.tracker.attribution().await.is_idle());
        assert_eq!(f.tracker.totals().await.unwrap().get("a.com"), Some(4.0));
    }

    struct BrokenHost;

    #[async_trait]
    impl TabHost for BrokenHost {
        async fn active_tab(&self) -> Result<Option<Tab>, HostError> {
            Err(HostError::Query("host disconnected".to_string()))
        }

        async fn tab(&self, _id: TabId) -> Result<Option<Tab>, HostError> {
            Err(HostError::Query("host disconnected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_lookup_error_treated_as_close() {
        let f = fixture();
        f.tracker.activate(TabId(1), "https://a.com").await;
        let listener = TabEventListener::new(f.tracker.clone(), Arc::new(BrokenHost));

        listener
            .handle(TabEvent::Activated { tab_id: TabId(2) })
            .await;
        assert_eq!(current_domain(&f.tracker).await, Some("a.com".to_string()));

        listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;
        assert!(f.tracker.attribution().await.is_idle());
    }

    #[tokio::test]
    async fn test_events_dropped_while_disabled() {
        let f = fixture();
        f.tracker.set_tracking(false).await;
        f.host.upsert(TabId(1), "https://a.com");

        f.listener
            .handle(TabEvent::Activated { tab_id: TabId(1) })
            .await;

        assert!(f.tracker.attribution().await.is_idle());
    }

    #[tokio::test]
    async fn test_run_drains_source() {
        let f = fixture();
        f.host.upsert(TabId(1), "https://a.com");
        f.host.upsert(TabId(2), "https://b.com");

        let (tx, rx) = mpsc::channel(8);
        tx.send(TabEvent::Activated { tab_id: TabId(1) }).await.unwrap();
        tx.send(TabEvent::Activated { tab_id: TabId(2) }).await.unwrap();
        drop(tx);

        f.listener.run(rx).await;

        assert_eq!(current_domain(&f.tracker).await, Some("b.com".to_string()));
    }

    #[tokio::test]
    async fn test_status_request() {
        let f = fixture();
        let request: StatusRequest =
            serde_json::from_str(r#"{"command":"getTrackingStatus"}"#).unwrap();

        let status = f.listener.respond(request);
        assert_eq!(
            serde_json::to_string(&status).unwrap(),
            r#"{"isTracking":true}"#
        );

        f.tracker.set_tracking(false).await;
        assert!(!f.listener.respond(request).is_tracking);
    }
}
