// Tab orchestration: open a tab per submission task, wait for it to become
// reachable, and deliver the task's payload into it.
//
// Readiness signals from the host are unreliable, so delivery is attempted
// both when the tab reports load completion and after a fixed fallback delay.
// Every attempt cycle enqueues the task, then drains the tab's whole queue
// once; entries older than `STALENESS` are dropped unsent.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::host::{BrowserHost, TabEvent, TabStatus};
use crate::protocol::{SubmissionTask, TabId};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Queued deliveries older than this are never sent.
pub const STALENESS: Duration = Duration::from_secs(10);

/// Delay after tab creation at which delivery is attempted regardless of
/// load events.
pub const FALLBACK_DELAY: Duration = Duration::from_millis(500);

/// How long after tab creation a load event may still trigger delivery.
/// After this the tab's watcher and liveness entry are dropped.
pub const WATCHER_LIFETIME: Duration = STALENESS;

// ---------------------------------------------------------------------------
// DeliveryQueues
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QueuedDelivery {
    pub task: SubmissionTask,
    pub enqueued_at: Instant,
}

/// Per-tab FIFO of pending deliveries.
#[derive(Debug, Default)]
pub struct DeliveryQueues {
    queues: HashMap<TabId, Vec<QueuedDelivery>>,
}

impl DeliveryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, tab: TabId, task: SubmissionTask, now: Instant) {
        self.queues.entry(tab).or_default().push(QueuedDelivery {
            task,
            enqueued_at: now,
        });
    }

    /// Empty the tab's queue and return the entries still fresh at `now`, in
    /// enqueue order.
    pub fn drain(&mut self, tab: TabId, now: Instant) -> Vec<SubmissionTask> {
        let Some(queue) = self.queues.remove(&tab) else {
            return Vec::new();
        };

        queue
            .into_iter()
            .filter_map(|entry| {
                let age = now.saturating_duration_since(entry.enqueued_at);
                if age > STALENESS {
                    debug!("Dropping stale delivery for {tab} ({age:?} old)");
                    None
                } else {
                    Some(entry.task)
                }
            })
            .collect()
    }

    pub fn len(&self, tab: TabId) -> usize {
        self.queues.get(&tab).map_or(0, Vec::len)
    }

    pub fn discard(&mut self, tab: TabId) {
        self.queues.remove(&tab);
    }
}

// ---------------------------------------------------------------------------
// TabOrchestrator
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Internal {
    Opened { tab: TabId, task: SubmissionTask },
    FallbackElapsed { tab: TabId, task: SubmissionTask },
    WatcherExpired { tab: TabId },
}

pub struct TabOrchestrator<H: BrowserHost> {
    host: Arc<H>,
    tasks_rx: mpsc::Receiver<SubmissionTask>,
    tab_events: broadcast::Receiver<TabEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    queues: DeliveryQueues,
    /// One-shot load listeners: tab -> task to deliver on `Complete`.
    load_watchers: HashMap<TabId, SubmissionTask>,
    /// Tabs opened by us that have not been removed.
    live: HashSet<TabId>,
}

impl<H: BrowserHost> TabOrchestrator<H> {
    /// Subscribes to tab events immediately so no load event is missed
    /// between tab creation and registration of its listener.
    pub fn new(host: Arc<H>, tasks_rx: mpsc::Receiver<SubmissionTask>) -> Self {
        let tab_events = host.tab_events();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            host,
            tasks_rx,
            tab_events,
            internal_tx,
            internal_rx,
            queues: DeliveryQueues::new(),
            load_watchers: HashMap::new(),
            live: HashSet::new(),
        }
    }

    /// Run until the task channel closes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Tab orchestrator started");
        let mut events_open = true;

        loop {
            tokio::select! {
                task = self.tasks_rx.recv() => {
                    match task {
                        Some(task) => self.open_tab(task),
                        None => {
                            info!("Task channel closed, orchestrator stopping");
                            break;
                        }
                    }
                }

                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal);
                }

                event = self.tab_events.recv(), if events_open => {
                    match event {
                        Ok(event) => self.handle_tab_event(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Missed {skipped} tab events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Tab event stream closed; relying on fallback delivery");
                            events_open = false;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn open_tab(&self, task: SubmissionTask) {
        let host = self.host.clone();
        let internal_tx = self.internal_tx.clone();
        tokio::spawn(async move {
            match host.create_tab(&task.target_url).await {
                Ok(tab) => {
                    let _ = internal_tx.send(Internal::Opened { tab, task });
                }
                Err(e) => warn!("{e}"),
            }
        });
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Opened { tab, task } => {
                info!("Opened {tab} for {}", task.target_url);
                self.live.insert(tab);
                self.load_watchers.insert(tab, task.clone());

                let internal_tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(FALLBACK_DELAY).await;
                    let _ = internal_tx.send(Internal::FallbackElapsed { tab, task });
                    tokio::time::sleep(WATCHER_LIFETIME - FALLBACK_DELAY).await;
                    let _ = internal_tx.send(Internal::WatcherExpired { tab });
                });
            }
            Internal::FallbackElapsed { tab, task } => {
                if self.live.contains(&tab) {
                    debug!("Fallback delivery for {tab}");
                    self.attempt_cycle(tab, task);
                }
            }
            Internal::WatcherExpired { tab } => {
                if self.load_watchers.remove(&tab).is_some() {
                    debug!("{tab} never reported load completion; watcher dropped");
                }
                self.live.remove(&tab);
            }
        }
    }

    fn handle_tab_event(&mut self, event: TabEvent) {
        match event.status {
            TabStatus::Complete => {
                if let Some(task) = self.load_watchers.remove(&event.tab) {
                    debug!("{} finished loading", event.tab);
                    self.attempt_cycle(event.tab, task);
                }
            }
            TabStatus::Removed => {
                if self.live.remove(&event.tab) {
                    debug!("{} was closed", event.tab);
                }
                self.load_watchers.remove(&event.tab);
                self.queues.discard(event.tab);
            }
            TabStatus::Loading => {}
        }
    }

    /// Enqueue `task` for `tab`, then drain the tab's queue into one
    /// delivery run.
    fn attempt_cycle(&mut self, tab: TabId, task: SubmissionTask) {
        let now = Instant::now();
        self.queues.enqueue(tab, task, now);
        let batch = self.queues.drain(tab, now);
        if batch.is_empty() {
            return;
        }

        let host = self.host.clone();
        tokio::spawn(async move {
            for task in batch {
                deliver(host.as_ref(), tab, &task).await;
            }
        });
    }
}

/// Inject the automation runtime, then send the message. Failures are logged;
/// the staleness window and the second trigger are the only retries.
async fn deliver<H: BrowserHost>(host: &H, tab: TabId, task: &SubmissionTask) {
    if let Err(e) = host.inject_automation(tab).await {
        warn!("{e}");
    }
    match host.send_message(tab, &task.to_message()).await {
        Ok(()) => debug!("Delivered payload to {tab}"),
        Err(e) => warn!("Message failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostError;
    use crate::protocol::{DeliveryMessage, Payload};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    fn task(url: &str) -> SubmissionTask {
        SubmissionTask {
            target_url: url.to_string(),
            payload: Payload::Code("code".into()),
        }
    }

    // -----------------------------------------------------------------------
    // DeliveryQueues
    // -----------------------------------------------------------------------

    #[test]
    fn drain_returns_entries_in_enqueue_order() {
        let mut queues = DeliveryQueues::new();
        let now = Instant::now();
        queues.enqueue(TabId(1), task("a"), now);
        queues.enqueue(TabId(1), task("b"), now);
        queues.enqueue(TabId(2), task("c"), now);

        let drained = queues.drain(TabId(1), now);
        assert_eq!(drained, vec![task("a"), task("b")]);
        assert_eq!(queues.len(TabId(1)), 0);
        assert_eq!(queues.len(TabId(2)), 1);
    }

    #[test]
    fn stale_entries_are_dropped_and_never_return() {
        let mut queues = DeliveryQueues::new();
        let t0 = Instant::now();
        queues.enqueue(TabId(1), task("old"), t0);
        queues.enqueue(TabId(1), task("fresh"), t0 + Duration::from_secs(5));

        let drained = queues.drain(TabId(1), t0 + STALENESS + Duration::from_millis(1));
        assert_eq!(drained, vec![task("fresh")]);
        assert!(queues.drain(TabId(1), t0 + STALENESS * 2).is_empty());
    }

    #[test]
    fn entry_exactly_at_threshold_is_still_fresh() {
        let mut queues = DeliveryQueues::new();
        let t0 = Instant::now();
        queues.enqueue(TabId(1), task("edge"), t0);
        assert_eq!(queues.drain(TabId(1), t0 + STALENESS), vec![task("edge")]);
    }

    #[test]
    fn draining_an_empty_queue_has_no_effect() {
        let mut queues = DeliveryQueues::new();
        let now = Instant::now();
        assert!(queues.drain(TabId(9), now).is_empty());
        assert!(queues.drain(TabId(9), now).is_empty());
        assert_eq!(queues.len(TabId(9)), 0);
        assert!(queues.queues.is_empty());
    }

    // -----------------------------------------------------------------------
    // TabOrchestrator with a scripted host
    // -----------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Created(String),
        Injected(TabId),
        Sent(TabId, DeliveryMessage),
    }

    struct FakeHost {
        next_tab: AtomicU64,
        events: broadcast::Sender<TabEvent>,
        calls: Mutex<Vec<Call>>,
        fail_sends: bool,
    }

    impl FakeHost {
        fn new(fail_sends: bool) -> Arc<Self> {
            let (events, _) = broadcast::channel(16);
            Arc::new(Self {
                next_tab: AtomicU64::new(1),
                events,
                calls: Mutex::new(Vec::new()),
                fail_sends,
            })
        }

        fn emit(&self, tab: TabId, status: TabStatus) {
            let _ = self.events.send(TabEvent { tab, status });
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn sends(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Sent(..)))
                .count()
        }
    }

    #[async_trait]
    impl BrowserHost for FakeHost {
        async fn create_tab(&self, url: &str) -> Result<TabId, HostError> {
            self.calls.lock().unwrap().push(Call::Created(url.to_string()));
            Ok(TabId(self.next_tab.fetch_add(1, Ordering::Relaxed)))
        }

        fn tab_events(&self) -> broadcast::Receiver<TabEvent> {
            self.events.subscribe()
        }

        async fn inject_automation(&self, tab: TabId) -> Result<(), HostError> {
            self.calls.lock().unwrap().push(Call::Injected(tab));
            Ok(())
        }

        async fn send_message(
            &self,
            tab: TabId,
            message: &DeliveryMessage,
        ) -> Result<(), HostError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Sent(tab, message.clone()));
            if self.fail_sends {
                Err(HostError::NoReceiver { tab })
            } else {
                Ok(())
            }
        }
    }

    fn start(host: &Arc<FakeHost>) -> mpsc::Sender<SubmissionTask> {
        let (tasks_tx, tasks_rx) = mpsc::channel(8);
        let orchestrator = TabOrchestrator::new(host.clone(), tasks_rx);
        tokio::spawn(orchestrator.run());
        tasks_tx
    }

    #[tokio::test]
    async fn fallback_delivers_without_load_event() {
        tokio::time::pause();
        let host = FakeHost::new(false);
        let tasks_tx = start(&host);

        tasks_tx.send(task("https://nowcoder.com/p")).await.unwrap();
        tokio::time::sleep(FALLBACK_DELAY - Duration::from_millis(50)).await;
        assert_eq!(host.sends(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            host.calls(),
            vec![
                Call::Created("https://nowcoder.com/p".into()),
                Call::Injected(TabId(1)),
                Call::Sent(
                    TabId(1),
                    DeliveryMessage {
                        url: "https://nowcoder.com/p".into(),
                        code: Payload::Code("code".into()),
                    }
                ),
            ]
        );
    }

    #[tokio::test]
    async fn load_event_and_fallback_each_run_one_cycle() {
        tokio::time::pause();
        let host = FakeHost::new(false);
        let tasks_tx = start(&host);

        tasks_tx.send(task("https://nowcoder.com/p")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.emit(TabId(1), TabStatus::Complete);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.sends(), 1);

        // The listener is one-shot: a second completion does nothing.
        host.emit(TabId(1), TabStatus::Complete);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(host.sends(), 2, "load cycle plus fallback cycle");
    }

    #[tokio::test]
    async fn failed_delivery_is_not_retried() {
        tokio::time::pause();
        let host = FakeHost::new(true);
        let tasks_tx = start(&host);

        tasks_tx.send(task("https://nowcoder.com/p")).await.unwrap();
        tokio::time::sleep(STALENESS * 2).await;
        assert_eq!(host.sends(), 1);
    }

    #[tokio::test]
    async fn removed_tab_gets_nothing() {
        tokio::time::pause();
        let host = FakeHost::new(false);
        let tasks_tx = start(&host);

        tasks_tx.send(task("https://nowcoder.com/p")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        host.emit(TabId(1), TabStatus::Removed);
        host.emit(TabId(1), TabStatus::Complete);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(host.sends(), 0);
        assert_eq!(host.calls(), vec![Call::Created("https://nowcoder.com/p".into())]);
    }

    #[tokio::test]
    async fn separate_tasks_get_separate_tabs() {
        tokio::time::pause();
        let host = FakeHost::new(false);
        let tasks_tx = start(&host);

        tasks_tx.send(task("https://nowcoder.com/a")).await.unwrap();
        tasks_tx.send(task("https://nowcoder.com/b")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut sent: Vec<(TabId, String)> = host
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Sent(tab, msg) => Some((tab, msg.url)),
                _ => None,
            })
            .collect();
        sent.sort();
        assert_eq!(sent.len(), 2);
        assert_ne!(sent[0].0, sent[1].0);
    }

    #[tokio::test]
    async fn tab_bookkeeping_is_released_without_host_events() {
        tokio::time::pause();
        let host = FakeHost::new(false);
        let (_tasks_tx, tasks_rx) = mpsc::channel(8);
        let mut orchestrator = TabOrchestrator::new(host.clone(), tasks_rx);

        for n in 1..=5 {
            orchestrator.handle_internal(Internal::Opened {
                tab: TabId(n),
                task: task("https://nowcoder.com/p"),
            });
        }
        assert_eq!(orchestrator.load_watchers.len(), 5);
        assert_eq!(orchestrator.live.len(), 5);

        tokio::time::sleep(WATCHER_LIFETIME + Duration::from_millis(10)).await;
        while let Ok(internal) = orchestrator.internal_rx.try_recv() {
            orchestrator.handle_internal(internal);
        }

        assert!(orchestrator.load_watchers.is_empty());
        assert!(orchestrator.live.is_empty());
        // Let the spawned fallback deliveries run.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(host.sends(), 5, "each tab still got its fallback delivery");
    }

    #[tokio::test]
    async fn late_load_event_after_expiry_delivers_nothing() {
        tokio::time::pause();
        let host = FakeHost::new(false);
        let tasks_tx = start(&host);

        tasks_tx.send(task("https://nowcoder.com/p")).await.unwrap();
        tokio::time::sleep(WATCHER_LIFETIME + Duration::from_secs(1)).await;
        assert_eq!(host.sends(), 1);

        host.emit(TabId(1), TabStatus::Complete);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(host.sends(), 1);
    }
}
