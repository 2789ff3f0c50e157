// Per-tab content runtime: receives delivery messages for one page and runs
// the matching site automation against it.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::page::PageContext;
use super::AutomationOutcome;
use crate::dispatch::ProfileRegistry;
use crate::protocol::DeliveryMessage;

/// Outcome report for one attempt.
pub type OutcomeReport = (DeliveryMessage, AutomationOutcome);

pub struct ContentRuntime<P: PageContext + ?Sized + 'static> {
    page: Arc<P>,
    registry: Arc<ProfileRegistry>,
    /// Messages whose attempt is running or has submitted. A repeat of any
    /// of these is dropped.
    claimed: HashSet<DeliveryMessage>,
    outcomes: Option<mpsc::UnboundedSender<OutcomeReport>>,
}

impl<P: PageContext + ?Sized + 'static> ContentRuntime<P> {
    pub fn new(page: Arc<P>, registry: Arc<ProfileRegistry>) -> Self {
        Self {
            page,
            registry,
            claimed: HashSet::new(),
            outcomes: None,
        }
    }

    /// Report every finished attempt on `tx`.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<OutcomeReport>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    /// Process messages until `rx` closes, then let running attempts finish.
    pub async fn run(mut self, mut rx: mpsc::Receiver<DeliveryMessage>) {
        let mut attempts: JoinSet<OutcomeReport> = JoinSet::new();
        let mut open = true;

        loop {
            tokio::select! {
                msg = rx.recv(), if open => match msg {
                    Some(message) => self.handle_message(message, &mut attempts),
                    None => {
                        debug!("Delivery channel closed");
                        open = false;
                    }
                },
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    match joined {
                        Ok(report) => self.finish(report),
                        Err(e) => warn!("Automation task failed: {e}"),
                    }
                }
                else => break,
            }
        }
    }

    fn handle_message(&mut self, message: DeliveryMessage, attempts: &mut JoinSet<OutcomeReport>) {
        let Some(profile) = self.registry.profile_for(&message.url) else {
            info!("Default action for {}", message.url);
            return;
        };

        if !self.claimed.insert(message.clone()) {
            debug!("Duplicate delivery for {} ignored", message.url);
            return;
        }

        let strategy = profile.automation();
        info!(
            "Running {} automation for {} ({})",
            strategy.kind(),
            message.url,
            profile.name()
        );
        let page = Arc::clone(&self.page);
        attempts.spawn(async move {
            let outcome = strategy.run(page.as_ref(), &message.code).await;
            (message, outcome)
        });
    }

    fn finish(&mut self, (message, outcome): OutcomeReport) {
        match &outcome {
            AutomationOutcome::Submitted => info!("Submitted {}", message.url),
            AutomationOutcome::TimedOut => warn!("Automation timed out for {}", message.url),
            AutomationOutcome::Abandoned(reason) => {
                warn!("Automation abandoned for {}: {reason}", message.url)
            }
        }
        if outcome != AutomationOutcome::Submitted {
            self.claimed.remove(&message);
        }
        if let Some(tx) = &self.outcomes {
            let _ = tx.send((message, outcome));
        }
    }
}
