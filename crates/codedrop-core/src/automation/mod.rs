// Per-site automation: put the delivered code into the judge's editor and
// trigger submission.
//
// Three strategies cover the supported judges. Each attempt is single-shot
// and bounded by `WAIT_BUDGET`; nothing here confirms that the judge
// accepted the submission.

pub mod injection;
pub mod observer;
pub mod page;
pub mod runtime;
pub mod sequence;

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::protocol::Payload;
use page::{PageContext, PageError};

pub use injection::InjectionSelectors;
pub use observer::ObserverSelectors;
pub use sequence::SequenceSelectors;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Longest an automation may wait for its page elements.
pub const WAIT_BUDGET: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

/// Progress of one automation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteAutomationState {
    /// Looking for the editor and submit control.
    Waiting,
    /// Both are present; content is being replaced.
    Ready,
    Submitted,
    TimedOut,
    /// A single-shot step found nothing to act on, or the page failed.
    Abandoned,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationOutcome {
    Submitted,
    /// Required elements did not appear within the wait budget.
    TimedOut,
    /// The attempt stopped for another reason (missing element in a
    /// single-shot step, page error, unusable payload).
    Abandoned(String),
}

impl AutomationOutcome {
    /// Terminal state this outcome corresponds to.
    pub fn state(&self) -> SiteAutomationState {
        match self {
            AutomationOutcome::Submitted => SiteAutomationState::Submitted,
            AutomationOutcome::TimedOut => SiteAutomationState::TimedOut,
            AutomationOutcome::Abandoned(_) => SiteAutomationState::Abandoned,
        }
    }
}

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("timed out after {budget:?} waiting for {selector}")]
    Timeout { selector: String, budget: Duration },

    #[error(transparent)]
    Page(#[from] PageError),
}

// ---------------------------------------------------------------------------
// AutomationStrategy
// ---------------------------------------------------------------------------

/// How a judge's submit page is driven. Chosen by the judge profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationStrategy {
    /// Watch DOM mutations until editor and submit button exist, then type
    /// the code in and click submit.
    ObserverDriven(ObserverSelectors),
    /// One page-world script that sets the code through the editor widget's
    /// own API and clicks submit.
    DirectInjection(InjectionSelectors),
    /// Pick the problem, switch to the plain-text editor, fill it and submit,
    /// polling for each control in turn.
    PollSequence(SequenceSelectors),
}

impl AutomationStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            AutomationStrategy::ObserverDriven(_) => "observer-driven",
            AutomationStrategy::DirectInjection(_) => "direct-injection",
            AutomationStrategy::PollSequence(_) => "poll-sequence",
        }
    }

    /// Run one attempt against `page`.
    pub async fn run<P>(&self, page: &P, payload: &Payload) -> AutomationOutcome
    where
        P: PageContext + ?Sized,
    {
        match self {
            AutomationStrategy::ObserverDriven(selectors) => {
                observer::run(page, selectors, payload.code()).await
            }
            AutomationStrategy::DirectInjection(selectors) => {
                injection::run(page, selectors, payload.code()).await
            }
            AutomationStrategy::PollSequence(selectors) => match payload.problem() {
                Some(problem) => sequence::run(page, selectors, payload.code(), problem).await,
                None => {
                    warn!("Poll-sequence automation needs a problem identifier");
                    AutomationOutcome::Abandoned("payload has no problem identifier".into())
                }
            },
        }
    }
}
