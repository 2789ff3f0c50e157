// Mutation-driven automation: re-check for the editor and submit control on
// every DOM mutation, then replace the editor content line by line and click
// submit.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::page::{EditCommand, PageContext, PageError};
use super::{AutomationOutcome, SiteAutomationState, WAIT_BUDGET};

/// Delay of the one unconditional check made even if no mutation arrives.
pub const OBSERVER_FALLBACK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverSelectors {
    pub editor: String,
    pub submit: String,
}

impl Default for ObserverSelectors {
    fn default() -> Self {
        Self {
            editor: r#"div.cm-content.cm-lineWrapping[contenteditable="true"]"#.into(),
            submit: r#"button.solid.lform-size-middle[type="button"][style*="margin-top: 1em"]"#
                .into(),
        }
    }
}

pub async fn run<P>(page: &P, selectors: &ObserverSelectors, code: &str) -> AutomationOutcome
where
    P: PageContext + ?Sized,
{
    // Without an observer only the fallback check can find the elements.
    let (mut mutations, mut observing) = match page.observe_mutations().await {
        Ok(rx) => (rx, true),
        Err(e) => {
            warn!("Cannot observe page ({e}); relying on the fallback check");
            let (_closed_tx, rx) = tokio::sync::mpsc::channel(1);
            (rx, false)
        }
    };

    let deadline = Instant::now() + WAIT_BUDGET;
    let fallback = tokio::time::sleep(OBSERVER_FALLBACK);
    tokio::pin!(fallback);
    let mut fallback_pending = true;
    let mut state = SiteAutomationState::Waiting;
    debug!("Automation state: {state:?}");

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Editor not ready after {WAIT_BUDGET:?}, aborting");
                state = SiteAutomationState::TimedOut;
                debug!("Automation state: {state:?}");
                return AutomationOutcome::TimedOut;
            }
            _ = &mut fallback, if fallback_pending => {
                fallback_pending = false;
            }
            batch = mutations.recv(), if observing => {
                if batch.is_none() {
                    debug!("Mutation observer went away; waiting on fallback and deadline");
                    observing = false;
                    continue;
                }
            }
        }

        match elements_ready(page, selectors).await {
            Ok(false) => continue,
            Ok(true) => {
                state = SiteAutomationState::Ready;
                debug!("Automation state: {state:?}");
            }
            Err(e) => {
                warn!("Element lookup failed: {e}");
                continue;
            }
        }

        // Dropping the receiver disconnects the observer whatever happens next.
        drop(mutations);
        return match submit(page, selectors, code).await {
            Ok(()) => {
                info!("Clicked submit button");
                AutomationOutcome::Submitted
            }
            Err(e) => {
                error!("Submitting failed: {e}");
                AutomationOutcome::Abandoned(e.to_string())
            }
        };
    }
}

async fn elements_ready<P>(page: &P, selectors: &ObserverSelectors) -> Result<bool, PageError>
where
    P: PageContext + ?Sized,
{
    Ok(page.exists(&selectors.editor).await? && page.exists(&selectors.submit).await?)
}

async fn submit<P>(page: &P, selectors: &ObserverSelectors, code: &str) -> Result<(), PageError>
where
    P: PageContext + ?Sized,
{
    page.focus(&selectors.editor).await?;
    page.edit(EditCommand::SelectAll).await?;
    page.edit(EditCommand::Delete).await?;
    debug!("Editor cleared");

    let lines: Vec<&str> = code.split('\n').collect();
    let last = lines.len() - 1;
    for (index, line) in lines.into_iter().enumerate() {
        page.edit(EditCommand::InsertText(line.to_string())).await?;
        if index != last {
            page.edit(EditCommand::InsertLineBreak).await?;
        }
    }
    debug!("Code inserted into editor");

    page.click(&selectors.submit).await
}
