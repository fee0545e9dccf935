//! Run command: the tracking engine behind a JSON-lines bridge.
//!
//! The browser side (a native-messaging relay, for example) writes one JSON
//! message per line on stdin:
//!
//! - `{"type":"activated","tab_id":1,"url":"https://a.com"}`
//! - `{"type":"updated","tab_id":1,"url":"https://b.com"}` (`url` optional)
//! - `{"type":"removed","tab_id":1}`
//! - `{"command":"getTrackingStatus"}`
//! - `{"command":"setTracking","enabled":false}`
//! - `{"command":"clearAll"}`
//!
//! Commands get exactly one JSON response line on stdout; tab events get
//! none. Logs go to stderr. The relayed events also keep a mirror of the
//! browser's tabs, which answers the engine's "which tab is active" queries.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tabtime_core::{
    Clock, FlushScheduler, KeyValueStore, StatusRequest, SystemClock, TabEvent, TabEventListener,
    TabId, TabMirror, Tracker,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::Config;

/// Tab notifications relayed from the browser, with the URL when known.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RelayedEvent {
    Activated {
        tab_id: TabId,
        #[serde(default)]
        url: Option<String>,
    },
    Updated {
        tab_id: TabId,
        #[serde(default)]
        url: Option<String>,
    },
    Removed {
        tab_id: TabId,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
enum Command {
    GetTrackingStatus,
    SetTracking { enabled: bool },
    ClearAll,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Message {
    Event(RelayedEvent),
    Command(Command),
}

/// A started engine plus the mirror that feeds it.
pub struct Bridge {
    tracker: Arc<Tracker>,
    listener: TabEventListener,
    mirror: Arc<TabMirror>,
    scheduler: FlushScheduler,
}

impl Bridge {
    /// Starts the engine: initializes the aggregate, attributes the active
    /// tab (if the mirror knows one) and starts flushing.
    pub async fn start(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, config: &Config) -> Self {
        let mirror = Arc::new(TabMirror::new());
        let tracker = Arc::new(
            Tracker::new(store, mirror.clone(), clock).with_tracking(config.tracking_enabled),
        );
        tracker.start().await;

        let listener = TabEventListener::new(tracker.clone(), mirror.clone());
        let scheduler = FlushScheduler::new(config.flush_interval());
        if tracker.is_tracking() {
            scheduler.start(tracker.clone());
        }

        Self {
            tracker,
            listener,
            mirror,
            scheduler,
        }
    }

    /// Applies one input line. Returns the response to write, if any.
    pub async fn handle_line(&self, line: &str) -> Option<Value> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(Message::Event(event)) => {
                self.relay(event).await;
                None
            }
            Ok(Message::Command(command)) => Some(self.execute(command).await),
            Err(e) => {
                warn!(error = %e, "ignoring malformed message");
                Some(json!({ "error": format!("malformed message: {e}") }))
            }
        }
    }

    /// Stops flushing, settles the running window one last time and waits
    /// until the store has acknowledged every write.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        self.tracker.tick().await;
        self.tracker.settled().await;
        info!("engine stopped");
    }

    async fn relay(&self, event: RelayedEvent) {
        debug!(?event, "relayed event");
        match event {
            RelayedEvent::Activated { tab_id, url } => {
                if let Some(url) = url {
                    self.mirror.upsert(tab_id, url);
                }
                self.mirror.set_active(tab_id);
                self.listener.handle(TabEvent::Activated { tab_id }).await;
            }
            RelayedEvent::Updated { tab_id, url } => {
                if let Some(url) = &url {
                    self.mirror.upsert(tab_id, url.clone());
                }
                self.listener.handle(TabEvent::Updated { tab_id, url }).await;
            }
            RelayedEvent::Removed { tab_id } => {
                self.listener.handle(TabEvent::Removed { tab_id }).await;
                self.mirror.remove(tab_id);
            }
        }
    }

    async fn execute(&self, command: Command) -> Value {
        match command {
            Command::GetTrackingStatus => {
                json!(self.listener.respond(StatusRequest::GetTrackingStatus))
            }
            Command::SetTracking { enabled } => {
                self.tracker.set_tracking(enabled).await;
                if enabled {
                    self.scheduler.start(self.tracker.clone());
                } else {
                    self.scheduler.stop();
                }
                json!(self.listener.respond(StatusRequest::GetTrackingStatus))
            }
            Command::ClearAll => match self.tracker.clear_all().await {
                Ok(()) => json!({ "cleared": true }),
                Err(e) => {
                    warn!(error = %e, "clear failed");
                    json!({ "cleared": false, "error": e.to_string() })
                }
            },
        }
    }
}

/// Feeds `reader` into the bridge line by line until EOF.
pub async fn serve<R, W>(bridge: &Bridge, reader: R, writer: &mut W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        if let Some(response) = bridge.handle_line(&line).await {
            let mut encoded = response.to_string();
            encoded.push('\n');
            writer
                .write_all(encoded.as_bytes())
                .await
                .context("failed to write response")?;
            writer.flush().await.context("failed to write response")?;
        }
    }
    Ok(())
}

/// Runs the engine on stdin/stdout until EOF or Ctrl-C.
pub async fn run(config: &Config, store: Arc<dyn KeyValueStore>) -> Result<()> {
    let bridge = Bridge::start(store, Arc::new(SystemClock), config).await;
    info!(
        database = %config.database_path.display(),
        tracking = bridge.tracker.is_tracking(),
        "engine started"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let result = tokio::select! {
        result = serve(&bridge, stdin, &mut stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    bridge.shutdown().await;
    result
}
