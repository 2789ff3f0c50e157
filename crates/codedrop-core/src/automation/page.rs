// DOM capabilities the automation engine needs from a live page.
//
// Elements are addressed by CSS selector; each site's selectors are supplied
// with its strategy. Implementations run every call against the page's main
// world.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PageError {
    #[error("element not found: {selector}")]
    NotFound { selector: String },

    #[error("document has no body to observe")]
    NoBody,

    #[error("page script failed: {0}")]
    Script(String),

    #[error("page is no longer attached")]
    Detached,
}

/// Editing primitives applied at the current focus/selection, in the manner
/// of `document.execCommand`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditCommand {
    SelectAll,
    Delete,
    InsertText(String),
    InsertLineBreak,
}

/// Synthetic notifications a live form expects after a programmatic change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomEvent {
    Input,
    Change,
}

impl DomEvent {
    pub fn name(self) -> &'static str {
        match self {
            DomEvent::Input => "input",
            DomEvent::Change => "change",
        }
    }
}

#[async_trait]
pub trait PageContext: Send + Sync {
    /// Whether `selector` currently matches an element.
    async fn exists(&self, selector: &str) -> Result<bool, PageError>;

    async fn focus(&self, selector: &str) -> Result<(), PageError>;

    async fn edit(&self, command: EditCommand) -> Result<(), PageError>;

    /// Assign the element's `value` property.
    async fn set_value(&self, selector: &str, value: &str) -> Result<(), PageError>;

    /// Dispatch a bubbling event of the given kind on the element.
    async fn dispatch(&self, selector: &str, event: DomEvent) -> Result<(), PageError>;

    async fn is_checked(&self, selector: &str) -> Result<bool, PageError>;

    /// Whether the `<select>` at `selector` has an option with `value`.
    async fn has_option(&self, selector: &str, value: &str) -> Result<bool, PageError>;

    async fn click(&self, selector: &str) -> Result<(), PageError>;

    /// Start observing subtree mutations of the document body. One `()` is
    /// sent per observed batch; dropping the receiver disconnects.
    async fn observe_mutations(&self) -> Result<mpsc::Receiver<()>, PageError>;

    /// Evaluate a self-contained script and return its completion value.
    async fn run_script(&self, script: &str) -> Result<serde_json::Value, PageError>;
}
