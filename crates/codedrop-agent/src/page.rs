// `PageContext` over a Chrome DevTools Protocol page.
//
// Every operation is one small expression evaluated in the page's main world.
// Selectors and strings are embedded as JSON literals. Each expression must
// produce a value; `undefined` does not survive `into_value`.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::Page;
use codedrop_core::automation::page::{DomEvent, EditCommand, PageContext, PageError};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How often the mutation counter is read back from the page.
const MUTATION_POLL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct CdpPage {
    page: Page,
}

impl CdpPage {
    pub fn new(page: Page) -> Self {
        Self { page }
    }

    async fn eval(&self, script: String) -> Result<Value, PageError> {
        eval(&self.page, script).await
    }

    /// Run an element script that yields `false` when nothing matches.
    async fn on_element(&self, selector: &str, script: String) -> Result<(), PageError> {
        match self.eval(script).await? {
            Value::Bool(false) | Value::Null => Err(PageError::NotFound {
                selector: selector.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

async fn eval(page: &Page, script: String) -> Result<Value, PageError> {
    page.evaluate(script)
        .await
        .map_err(|e| PageError::Script(e.to_string()))?
        .into_value()
        .map_err(|e| PageError::Script(e.to_string()))
}

#[async_trait]
impl PageContext for CdpPage {
    async fn exists(&self, selector: &str) -> Result<bool, PageError> {
        Ok(self.eval(scripts::exists(selector)).await? == Value::Bool(true))
    }

    async fn focus(&self, selector: &str) -> Result<(), PageError> {
        self.on_element(selector, scripts::with_element(selector, "el.focus();"))
            .await
    }

    async fn edit(&self, command: EditCommand) -> Result<(), PageError> {
        self.eval(scripts::edit(&command)).await?;
        Ok(())
    }

    async fn set_value(&self, selector: &str, value: &str) -> Result<(), PageError> {
        let body = format!("el.value = {};", literal(value));
        self.on_element(selector, scripts::with_element(selector, &body))
            .await
    }

    async fn dispatch(&self, selector: &str, event: DomEvent) -> Result<(), PageError> {
        let body = format!(
            "el.dispatchEvent(new Event({}, {{ bubbles: true }}));",
            literal(event.name())
        );
        self.on_element(selector, scripts::with_element(selector, &body))
            .await
    }

    async fn is_checked(&self, selector: &str) -> Result<bool, PageError> {
        match self.eval(scripts::is_checked(selector)).await? {
            Value::Bool(checked) => Ok(checked),
            _ => Err(PageError::NotFound {
                selector: selector.to_string(),
            }),
        }
    }

    async fn has_option(&self, selector: &str, value: &str) -> Result<bool, PageError> {
        match self.eval(scripts::has_option(selector, value)).await? {
            Value::Bool(found) => Ok(found),
            _ => Err(PageError::NotFound {
                selector: selector.to_string(),
            }),
        }
    }

    async fn click(&self, selector: &str) -> Result<(), PageError> {
        self.on_element(selector, scripts::with_element(selector, "el.click();"))
            .await
    }

    async fn observe_mutations(&self) -> Result<mpsc::Receiver<()>, PageError> {
        if self.eval(scripts::INSTALL_OBSERVER.to_string()).await? != Value::Bool(true) {
            return Err(PageError::NoBody);
        }

        let (tx, rx) = mpsc::channel(16);
        let page = self.page.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MUTATION_POLL);
            let mut seen = 0u64;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                let count = match eval(&page, scripts::MUTATION_COUNT.to_string()).await {
                    Ok(value) => value.as_u64().unwrap_or(0),
                    Err(e) => {
                        debug!("Mutation polling stopped: {e}");
                        return;
                    }
                };
                if count > seen {
                    seen = count;
                    let _ = tx.try_send(());
                }
            }
            if let Err(e) = eval(&page, scripts::DISCONNECT_OBSERVER.to_string()).await {
                warn!("Failed to disconnect mutation observer: {e}");
            }
        });
        Ok(rx)
    }

    async fn run_script(&self, script: &str) -> Result<Value, PageError> {
        self.eval(script.to_string()).await
    }
}

/// JSON string literal, valid as a JavaScript string literal.
fn literal(s: &str) -> String {
    Value::from(s).to_string()
}

mod scripts {
    use super::literal;
    use codedrop_core::automation::page::EditCommand;

    pub const INSTALL_OBSERVER: &str = r#"(() => {
  if (!document.body) return false;
  if (!window.__codedropObserver) {
    window.__codedropMutations = 0;
    window.__codedropObserver = new MutationObserver(() => { window.__codedropMutations += 1; });
    window.__codedropObserver.observe(document.body, { childList: true, subtree: true });
  }
  return true;
})()"#;

    pub const MUTATION_COUNT: &str = "window.__codedropMutations || 0";

    pub const DISCONNECT_OBSERVER: &str = r#"(() => {
  if (window.__codedropObserver) {
    window.__codedropObserver.disconnect();
    delete window.__codedropObserver;
  }
  return true;
})()"#;

    pub fn exists(selector: &str) -> String {
        format!("document.querySelector({}) !== null", literal(selector))
    }

    /// Run `body` with `el` bound to the first match; `false` if none.
    pub fn with_element(selector: &str, body: &str) -> String {
        format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; {body} return true; }})()",
            literal(selector)
        )
    }

    pub fn is_checked(selector: &str) -> String {
        format!(
            "(() => {{ const el = document.querySelector({}); return el ? !!el.checked : null; }})()",
            literal(selector)
        )
    }

    pub fn has_option(selector: &str, value: &str) -> String {
        format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return null; \
             return Array.from(el.options || []).some(o => o.value === {}); }})()",
            literal(selector),
            literal(value)
        )
    }

    pub fn edit(command: &EditCommand) -> String {
        let (name, arg) = match command {
            EditCommand::SelectAll => ("selectAll", "null".to_string()),
            EditCommand::Delete => ("delete", "null".to_string()),
            EditCommand::InsertText(text) => ("insertText", literal(text)),
            EditCommand::InsertLineBreak => ("insertLineBreak", "null".to_string()),
        };
        format!("document.execCommand({}, false, {arg})", literal(name))
    }
}
