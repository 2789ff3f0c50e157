// `BrowserHost` over a Chrome instance reached through its DevTools endpoint.
//
// Tabs are CDP pages. Each tab gets a watcher task that reports load
// completion and removal; an injected tab gets a `ContentRuntime` fed by an
// mpsc channel that stands in for the extension message port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::{Browser, Page};
use codedrop_core::automation::runtime::ContentRuntime;
use codedrop_core::dispatch::ProfileRegistry;
use codedrop_core::host::{BrowserHost, HostError, TabEvent, TabStatus};
use codedrop_core::protocol::{DeliveryMessage, TabId};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::page::CdpPage;

/// Interval of the liveness check that detects closed tabs.
const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive failed liveness checks before a tab counts as closed.
const CLOSED_AFTER_FAILURES: u32 = 2;

/// Counts consecutive failed liveness checks. A single failure can be a busy
/// renderer or a navigation in flight; a success resets the count.
#[derive(Debug, Default)]
struct Liveness {
    failures: u32,
}

impl Liveness {
    /// Records one check and returns true once the tab should be treated as
    /// closed.
    fn record(&mut self, alive: bool) -> bool {
        if alive {
            self.failures = 0;
        } else {
            self.failures += 1;
        }
        self.failures >= CLOSED_AFTER_FAILURES
    }
}

struct TabEntry {
    page: Page,
    runtime: Option<mpsc::Sender<DeliveryMessage>>,
}

type TabMap = Arc<Mutex<HashMap<TabId, TabEntry>>>;

pub struct CdpHost {
    browser: Browser,
    registry: Arc<ProfileRegistry>,
    next_id: AtomicU64,
    tabs: TabMap,
    events: broadcast::Sender<TabEvent>,
}

impl CdpHost {
    pub fn new(browser: Browser, registry: Arc<ProfileRegistry>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            browser,
            registry,
            next_id: AtomicU64::new(1),
            tabs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn lock_tabs(&self) -> std::sync::MutexGuard<'_, HashMap<TabId, TabEntry>> {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner())
    }
}
/// Report `Complete` once navigation settles, then check the page every
/// second and report `Removed` after two checks in a row go unanswered.
async fn watch_tab(
    tab: TabId,
    page: Page,
    tabs: TabMap,
    events: broadcast::Sender<TabEvent>,
) {
    match page.wait_for_navigation().await {
        Ok(_) => {
            debug!("{tab} finished loading");
            let _ = events.send(TabEvent {
                tab,
                status: TabStatus::Complete,
            });
        }
        Err(e) => warn!("Waiting for {tab} to load failed: {e}"),
    }

    let mut ticker = tokio::time::interval(LIVENESS_INTERVAL);
    let mut liveness = Liveness::default();
    loop {
        ticker.tick().await;
        let alive = match page.evaluate("true").await {
            Ok(_) => true,
            Err(e) => {
                debug!("Liveness check on {tab} failed: {e}");
                false
            }
        };
        if liveness.record(alive) {
            break;
        }
    }

    info!("{tab} closed");
    tabs.lock().unwrap_or_else(|e| e.into_inner()).remove(&tab);
    let _ = events.send(TabEvent {
        tab,
        status: TabStatus::Removed,
    });
}

#[async_trait]
impl BrowserHost for CdpHost {
    async fn create_tab(&self, url: &str) -> Result<TabId, HostError> {
        let page = self
            .browser
            .new_page(url)
            .await
            .map_err(|e| HostError::TabCreation {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let tab = TabId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock_tabs().insert(
            tab,
            TabEntry {
                page: page.clone(),
                runtime: None,
            },
        );
        let _ = self.events.send(TabEvent {
            tab,
            status: TabStatus::Loading,
        });

        tokio::spawn(watch_tab(
            tab,
            page,
            Arc::clone(&self.tabs),
            self.events.clone(),
        ));
        Ok(tab)
    }

    fn tab_events(&self) -> broadcast::Receiver<TabEvent> {
        self.events.subscribe()
    }

    async fn inject_automation(&self, tab: TabId) -> Result<(), HostError> {
        let mut tabs = self.lock_tabs();
        let entry = tabs.get_mut(&tab).ok_or(HostError::TabClosed { tab })?;

        if entry.runtime.as_ref().is_some_and(|tx| !tx.is_closed()) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(16);
        let runtime = ContentRuntime::new(
            Arc::new(CdpPage::new(entry.page.clone())),
            Arc::clone(&self.registry),
        );
        tokio::spawn(runtime.run(rx));
        entry.runtime = Some(tx);
        debug!("Automation runtime installed in {tab}");
        Ok(())
    }

    async fn send_message(&self, tab: TabId, message: &DeliveryMessage) -> Result<(), HostError> {
        let tx = {
            let tabs = self.lock_tabs();
            let entry = tabs.get(&tab).ok_or(HostError::TabClosed { tab })?;
            entry.runtime.clone().ok_or(HostError::NoReceiver { tab })?
        };
        tx.send(message.clone())
            .await
            .map_err(|_| HostError::NoReceiver { tab })
    }
}
