// Judge-site profiles and the dispatcher that turns job frames into
// submission tasks.
//
// Each supported judge is one `JudgeProfile`. The registry asks every profile
// in registration order; each one that matches contributes its own task.
// The same registry is used inside the tab to pick the automation strategy
// for a delivered message.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::automation::AutomationStrategy;
use crate::protocol::{JobFrame, Payload, SubmissionTask};

// ---------------------------------------------------------------------------
// JudgeProfile
// ---------------------------------------------------------------------------

/// One supported online judge.
pub trait JudgeProfile: Send + Sync {
    /// Short human-readable name used in logs.
    fn name(&self) -> &'static str;

    /// Domain the profile claims. URLs containing it belong to this judge.
    fn domain(&self) -> &'static str;

    fn matches(&self, url: &str) -> bool {
        url.contains(self.domain())
    }

    /// Submission URL and payload for `job`, or `None` when the URL does not
    /// carry what this judge needs.
    fn derive_task(&self, job: &JobFrame) -> Option<SubmissionTask>;

    /// How code is put into this judge's submit page.
    fn automation(&self) -> AutomationStrategy;
}

/// Luogu: the problem page hosts its own submit form under `#submit`.
pub struct Luogu;

impl JudgeProfile for Luogu {
    fn name(&self) -> &'static str {
        "luogu"
    }

    fn domain(&self) -> &'static str {
        "luogu.com.cn"
    }

    fn derive_task(&self, job: &JobFrame) -> Option<SubmissionTask> {
        Some(SubmissionTask {
            target_url: format!("{}#submit", job.url),
            payload: Payload::Code(job.code.clone()),
        })
    }

    fn automation(&self) -> AutomationStrategy {
        AutomationStrategy::ObserverDriven(Default::default())
    }
}

static CONTEST_PROBLEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/contest/(\d+)/problem/([A-Z])").expect("contest pattern is valid")
});

static PROBLEMSET_PROBLEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/problemset/problem/(\d+)/([A-Z])").expect("problemset pattern is valid")
});

/// Codeforces: a shared submit form where the problem is chosen by index.
pub struct Codeforces;

impl Codeforces {
    /// Submission URL and problem identifier for a problem URL.
    pub fn resolve(url: &str) -> Option<(String, String)> {
        if url.contains("/contest/") {
            let caps = CONTEST_PROBLEM.captures(url)?;
            let contest = &caps[1];
            let letter = &caps[2];
            Some((
                format!("https://codeforces.com/contest/{contest}/submit"),
                letter.to_string(),
            ))
        } else if url.contains("/problemset/") {
            let caps = PROBLEMSET_PROBLEM.captures(url)?;
            Some((
                "https://codeforces.com/problemset/submit".to_string(),
                format!("{}{}", &caps[1], &caps[2]),
            ))
        } else {
            None
        }
    }
}

impl JudgeProfile for Codeforces {
    fn name(&self) -> &'static str {
        "codeforces"
    }

    fn domain(&self) -> &'static str {
        "codeforces.com"
    }

    fn derive_task(&self, job: &JobFrame) -> Option<SubmissionTask> {
        let (target_url, problem) = Self::resolve(&job.url)?;
        Some(SubmissionTask {
            target_url,
            payload: Payload::Problem {
                code: job.code.clone(),
                problem,
            },
        })
    }

    fn automation(&self) -> AutomationStrategy {
        AutomationStrategy::PollSequence(Default::default())
    }
}

/// NowCoder: the job URL is already the submit page.
pub struct NowCoder;

impl JudgeProfile for NowCoder {
    fn name(&self) -> &'static str {
        "nowcoder"
    }

    fn domain(&self) -> &'static str {
        "nowcoder.com"
    }

    fn derive_task(&self, job: &JobFrame) -> Option<SubmissionTask> {
        Some(SubmissionTask {
            target_url: job.url.clone(),
            payload: Payload::Code(job.code.clone()),
        })
    }

    fn automation(&self) -> AutomationStrategy {
        AutomationStrategy::DirectInjection(Default::default())
    }
}

// ---------------------------------------------------------------------------
// ProfileRegistry
// ---------------------------------------------------------------------------

/// Ordered set of judge profiles.
#[derive(Default)]
pub struct ProfileRegistry {
    profiles: Vec<Box<dyn JudgeProfile>>,
}

impl ProfileRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The judges supported out of the box.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(Luogu));
        registry.register(Box::new(Codeforces));
        registry.register(Box::new(NowCoder));
        registry
    }

    pub fn register(&mut self, profile: Box<dyn JudgeProfile>) {
        self.profiles.push(profile);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.profiles.iter().map(|p| p.name()).collect()
    }

    /// First profile whose domain appears in `url`.
    pub fn profile_for(&self, url: &str) -> Option<&dyn JudgeProfile> {
        self.profiles
            .iter()
            .find(|p| p.matches(url))
            .map(|p| p.as_ref())
    }

    /// Every task the registered profiles derive from `job`.
    pub fn dispatch(&self, job: &JobFrame) -> Vec<SubmissionTask> {
        let mut tasks = Vec::new();
        let mut matched = false;

        for profile in self.profiles.iter().filter(|p| p.matches(&job.url)) {
            matched = true;
            match profile.derive_task(job) {
                Some(task) => {
                    debug!("{} -> {}", profile.name(), task.target_url);
                    tasks.push(task);
                }
                None => info!(
                    "{} could not derive a submission from {}; dropping job",
                    profile.name(),
                    job.url
                ),
            }
        }

        if !matched {
            info!("No judge profile for {}; ignoring job", job.url);
        }
        tasks
    }
}

/// Resolve every incoming job and forward the resulting tasks.
pub async fn run_dispatcher(
    registry: Arc<ProfileRegistry>,
    mut jobs_rx: mpsc::Receiver<JobFrame>,
    tasks_tx: mpsc::Sender<SubmissionTask>,
) -> anyhow::Result<()> {
    info!("Dispatcher started with profiles {:?}", registry.names());

    while let Some(job) = jobs_rx.recv().await {
        for task in registry.dispatch(&job) {
            if tasks_tx.send(task).await.is_err() {
                info!("Task channel closed, dispatcher stopping");
                return Ok(());
            }
        }
    }

    info!("Job channel closed, dispatcher stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(url: &str) -> JobFrame {
        JobFrame {
            url: url.to_string(),
            code: "int main() {}".to_string(),
        }
    }

    #[test]
    fn luogu_appends_submit_anchor() {
        let tasks = ProfileRegistry::builtin().dispatch(&job("https://luogu.com.cn/problem/P1000"));
        assert_eq!(
            tasks,
            vec![SubmissionTask {
                target_url: "https://luogu.com.cn/problem/P1000#submit".into(),
                payload: Payload::Code("int main() {}".into()),
            }]
        );
    }

    #[test]
    fn luogu_www_host_also_matches() {
        let tasks =
            ProfileRegistry::builtin().dispatch(&job("https://www.luogu.com.cn/problem/P1001"));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target_url, "https://www.luogu.com.cn/problem/P1001#submit");
    }

    #[test]
    fn codeforces_contest_url() {
        let tasks = ProfileRegistry::builtin()
            .dispatch(&job("https://codeforces.com/contest/1234/problem/C"));
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].target_url.ends_with("/contest/1234/submit"));
        assert_eq!(
            tasks[0].payload,
            Payload::Problem {
                code: "int main() {}".into(),
                problem: "C".into(),
            }
        );
    }

    #[test]
    fn codeforces_problemset_url() {
        let tasks = ProfileRegistry::builtin()
            .dispatch(&job("https://codeforces.com/problemset/problem/1234/C"));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target_url, "https://codeforces.com/problemset/submit");
        assert_eq!(tasks[0].payload.problem(), Some("1234C"));
    }

    #[test]
    fn codeforces_unrecognised_shape_yields_nothing() {
        let registry = ProfileRegistry::builtin();
        assert!(registry.dispatch(&job("https://codeforces.com/blog/entry/1")).is_empty());
        assert!(registry
            .dispatch(&job("https://codeforces.com/contest/1234/standings"))
            .is_empty());
        assert!(registry
            .dispatch(&job("https://codeforces.com/problemset/problem/x/C"))
            .is_empty());
    }

    #[test]
    fn nowcoder_passes_url_through() {
        let url = "https://ac.nowcoder.com/acm/contest/1/A";
        let tasks = ProfileRegistry::builtin().dispatch(&job(url));
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].target_url, url);
        assert_eq!(tasks[0].payload, Payload::Code("int main() {}".into()));
    }

    #[test]
    fn unknown_site_yields_nothing() {
        assert!(ProfileRegistry::builtin()
            .dispatch(&job("https://atcoder.jp/contests/abc300/tasks/abc300_a"))
            .is_empty());
    }

    #[test]
    fn profile_for_selects_matching_strategy() {
        let registry = ProfileRegistry::builtin();
        let cf = registry
            .profile_for("https://codeforces.com/problemset/submit")
            .unwrap();
        assert_eq!(cf.name(), "codeforces");
        assert!(matches!(cf.automation(), AutomationStrategy::PollSequence(_)));

        let lg = registry.profile_for("https://www.luogu.com.cn/problem/P1#submit").unwrap();
        assert!(matches!(lg.automation(), AutomationStrategy::ObserverDriven(_)));

        let nc = registry.profile_for("https://ac.nowcoder.com/acm/x").unwrap();
        assert!(matches!(nc.automation(), AutomationStrategy::DirectInjection(_)));

        assert!(registry.profile_for("https://example.com").is_none());
    }

    struct Mirror;

    impl JudgeProfile for Mirror {
        fn name(&self) -> &'static str {
            "mirror"
        }
        fn domain(&self) -> &'static str {
            "luogu.com.cn"
        }
        fn derive_task(&self, job: &JobFrame) -> Option<SubmissionTask> {
            Some(SubmissionTask {
                target_url: format!("{}?mirror", job.url),
                payload: Payload::Code(job.code.clone()),
            })
        }
        fn automation(&self) -> AutomationStrategy {
            AutomationStrategy::DirectInjection(Default::default())
        }
    }

    #[test]
    fn every_matching_profile_contributes_in_order() {
        let mut registry = ProfileRegistry::builtin();
        registry.register(Box::new(Mirror));

        let tasks = registry.dispatch(&job("https://luogu.com.cn/problem/P1000"));
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].target_url.ends_with("#submit"));
        assert!(tasks[1].target_url.ends_with("?mirror"));
        assert_eq!(registry.names(), vec!["luogu", "codeforces", "nowcoder", "mirror"]);
    }

    #[tokio::test]
    async fn dispatcher_forwards_tasks_and_stops_on_close() {
        let (jobs_tx, jobs_rx) = mpsc::channel(8);
        let (tasks_tx, mut tasks_rx) = mpsc::channel(8);
        let handle = tokio::spawn(run_dispatcher(
            Arc::new(ProfileRegistry::builtin()),
            jobs_rx,
            tasks_tx,
        ));

        jobs_tx.send(job("https://example.com/nothing")).await.unwrap();
        jobs_tx
            .send(job("https://codeforces.com/contest/1/problem/A"))
            .await
            .unwrap();
        drop(jobs_tx);

        let task = tasks_rx.recv().await.unwrap();
        assert_eq!(task.target_url, "https://codeforces.com/contest/1/submit");
        assert!(tasks_rx.recv().await.is_none());
        assert!(handle.await.unwrap().is_ok());
    }
}
