//! Browser host collaborator: tab queries and tab notifications.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::TabId;

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    /// The host could not answer a tab query.
    #[error("tab query failed: {0}")]
    Query(String),
}

/// A browser tab as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub url: String,
}

/// Tab queries answered by the host.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// Returns the presently active tab, if any.
    async fn active_tab(&self) -> Result<Option<Tab>, HostError>;

    /// Looks up a tab by id. `Ok(None)` means the tab no longer exists.
    async fn tab(&self, id: TabId) -> Result<Option<Tab>, HostError>;
}

/// Tab notifications delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TabEvent {
    /// The user switched to a tab.
    Activated { tab_id: TabId },
    /// A tab changed; `url` is present only when the URL changed.
    Updated {
        tab_id: TabId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// A tab was closed.
    Removed { tab_id: TabId },
}

/// A stream of tab notifications.
#[async_trait]
pub trait TabEventSource: Send {
    /// Waits for the next notification. `None` means the host went away.
    async fn next_event(&mut self) -> Option<TabEvent>;
}

#[async_trait]
impl TabEventSource for mpsc::Receiver<TabEvent> {
    async fn next_event(&mut self) -> Option<TabEvent> {
        self.recv().await
    }
}

#[async_trait]
impl TabEventSource for mpsc::UnboundedReceiver<TabEvent> {
    async fn next_event(&mut self) -> Option<TabEvent> {
        self.recv().await
    }
}

/// A host that mirrors the browser's tab table from forwarded notifications.
///
/// Bridges that relay browser events (and tests) record each tab's URL and
/// the active tab here; the mirror then answers [`TabHost`] queries.
#[derive(Debug, Default)]
pub struct TabMirror {
    inner: Mutex<MirrorState>,
}

#[derive(Debug, Default)]
struct MirrorState {
    tabs: HashMap<TabId, String>,
    active: Option<TabId>,
}

impl TabMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a tab's current URL.
    pub fn upsert(&self, id: TabId, url: impl Into<String>) {
        self.lock().tabs.insert(id, url.into());
    }

    /// Marks a tab as the active one. Unknown tabs are accepted; lookups for
    /// them return `None` until a URL is recorded.
    pub fn set_active(&self, id: TabId) {
        self.lock().active = Some(id);
    }

    /// Forgets a closed tab.
    pub fn remove(&self, id: TabId) {
        let mut state = self.lock();
        state.tabs.remove(&id);
        if state.active == Some(id) {
            state.active = None;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MirrorState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl TabHost for TabMirror {
    async fn active_tab(&self) -> Result<Option<Tab>, HostError> {
        let state = self.lock();
        Ok(state.active.and_then(|id| {
            state.tabs.get(&id).map(|url| Tab {
                id,
                url: url.clone(),
            })
        }))
    }

    async fn tab(&self, id: TabId) -> Result<Option<Tab>, HostError> {
        Ok(self.lock().tabs.get(&id).map(|url| Tab {
            id,
            url: url.clone(),
        }))
    }
}
