// Poll-and-sequence automation: choose the problem, switch the editor to
// plain-text mode, fill in the code and submit, waiting for each control by
// polling. Any failed step aborts the rest.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::page::{DomEvent, PageContext};
use super::{AutomationError, AutomationOutcome, WAIT_BUDGET};

/// Interval between element lookups while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSelectors {
    /// `<select>` offering the problem indices of a contest.
    pub problem_select: String,
    /// Free-text problem code input on the problem-set submit page.
    pub problem_input: String,
    /// Checkbox switching between the rich editor and a plain textarea.
    pub editor_toggle: String,
    pub source_textarea: String,
    pub submit: String,
}

impl Default for SequenceSelectors {
    fn default() -> Self {
        Self {
            problem_select: r#"select[name="submittedProblemIndex"]"#.into(),
            problem_input: r#"input[name="submittedProblemCode"]"#.into(),
            editor_toggle: "#toggleEditorCheckbox".into(),
            source_textarea: "#sourceCodeTextarea".into(),
            submit: "#singlePageSubmitButton".into(),
        }
    }
}

/// Poll for `selector` every `interval` until it exists or `timeout` passes.
pub async fn wait_for<P>(
    page: &P,
    selector: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<(), AutomationError>
where
    P: PageContext + ?Sized,
{
    let mut ticker = tokio::time::interval(interval);
    // First tick is immediate; the first lookup happens one interval in.
    ticker.tick().await;
    let mut elapsed = Duration::ZERO;

    loop {
        ticker.tick().await;
        if page.exists(selector).await? {
            return Ok(());
        }
        elapsed += interval;
        if elapsed >= timeout {
            return Err(AutomationError::Timeout {
                selector: selector.to_string(),
                budget: timeout,
            });
        }
    }
}

pub async fn run<P>(
    page: &P,
    selectors: &SequenceSelectors,
    code: &str,
    problem: &str,
) -> AutomationOutcome
where
    P: PageContext + ?Sized,
{
    match run_steps(page, selectors, code, problem).await {
        Ok(()) => {
            info!("Submission triggered");
            AutomationOutcome::Submitted
        }
        Err(AutomationError::Timeout { selector, budget }) => {
            error!("Timeout waiting for {selector} after {budget:?}");
            AutomationOutcome::TimedOut
        }
        Err(e) => {
            error!("Sequence aborted: {e}");
            AutomationOutcome::Abandoned(e.to_string())
        }
    }
}

async fn run_steps<P>(
    page: &P,
    selectors: &SequenceSelectors,
    code: &str,
    problem: &str,
) -> Result<(), AutomationError>
where
    P: PageContext + ?Sized,
{
    if !select_problem(page, selectors, problem).await? {
        warn!("Problem selector not found");
    }

    wait_for(page, &selectors.editor_toggle, POLL_INTERVAL, WAIT_BUDGET).await?;
    if !page.is_checked(&selectors.editor_toggle).await? {
        page.click(&selectors.editor_toggle).await?;
        debug!("Editor toggled to textarea mode");
    }

    wait_for(page, &selectors.source_textarea, POLL_INTERVAL, WAIT_BUDGET).await?;
    set_textarea(page, &selectors.source_textarea, code).await?;

    wait_for(page, &selectors.submit, POLL_INTERVAL, WAIT_BUDGET).await?;
    debug!("Submit button found, submitting");
    page.click(&selectors.submit).await?;
    Ok(())
}

/// Pick the problem through the index `<select>` when it offers `problem`,
/// otherwise through the free-text input. Returns whether either worked.
async fn select_problem<P>(
    page: &P,
    selectors: &SequenceSelectors,
    problem: &str,
) -> Result<bool, AutomationError>
where
    P: PageContext + ?Sized,
{
    let select = &selectors.problem_select;
    if page.exists(select).await? && page.has_option(select, problem).await? {
        page.set_value(select, problem).await?;
        page.dispatch(select, DomEvent::Change).await?;
        debug!("Problem selected via select: {problem}");
        return Ok(true);
    }

    let input = &selectors.problem_input;
    if page.exists(input).await? {
        page.set_value(input, "").await?;
        page.dispatch(input, DomEvent::Input).await?;
        page.set_value(input, problem).await?;
        page.dispatch(input, DomEvent::Input).await?;
        debug!("Problem filled via input: {problem}");
        return Ok(true);
    }

    Ok(false)
}

async fn set_textarea<P>(page: &P, selector: &str, code: &str) -> Result<(), AutomationError>
where
    P: PageContext + ?Sized,
{
    page.set_value(selector, "").await?;
    page.dispatch(selector, DomEvent::Input).await?;
    page.set_value(selector, code).await?;
    page.dispatch(selector, DomEvent::Input).await?;
    page.dispatch(selector, DomEvent::Change).await?;
    debug!("Textarea cleared and new code inserted");
    Ok(())
}
