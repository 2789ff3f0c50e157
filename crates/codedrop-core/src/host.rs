// Capabilities the browser host provides to the background side: opening
// tabs, watching their lifecycle, and delivering messages into them.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::protocol::{DeliveryMessage, TabId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    Loading,
    /// Navigation finished. The page's own scripts may still be starting.
    Complete,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabEvent {
    pub tab: TabId,
    pub status: TabStatus,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to open tab for {url}: {message}")]
    TabCreation { url: String, message: String },

    #[error("failed to inject automation into {tab}: {message}")]
    Injection { tab: TabId, message: String },

    #[error("could not deliver to {tab}: receiving end does not exist")]
    NoReceiver { tab: TabId },

    #[error("{tab} is closed")]
    TabClosed { tab: TabId },
}

#[async_trait]
pub trait BrowserHost: Send + Sync + 'static {
    /// Open a new tab navigated to `url`.
    async fn create_tab(&self, url: &str) -> Result<TabId, HostError>;

    /// Subscribe to lifecycle events for all tabs.
    fn tab_events(&self) -> broadcast::Receiver<TabEvent>;

    /// Make sure the tab's page context has the automation runtime loaded.
    async fn inject_automation(&self, tab: TabId) -> Result<(), HostError>;

    /// Hand a message to the tab's automation runtime.
    async fn send_message(&self, tab: TabId, message: &DeliveryMessage) -> Result<(), HostError>;
}
