use bughunt::autonomy::{decide, ActionKind, Decision, Outcome, RiskLevel};
use bughunt::chamber::{
    Chamber, ModelProvider, Participant, ParticipantOutcome, ProviderReply, Usage,
};
use bughunt::convergence::{ConvergenceLoop, HumanAnswer, HumanGate, StopReason, Unattended};
use bughunt::diff::apply_diff;
use bughunt::error::{ProviderError, ProviderErrorKind};
use bughunt::ladder::EscalationLadder;
use bughunt::report::ProposalSkeleton;
use bughunt::store::{SessionStatus, SessionStore};
use bughunt::{Analyzer, CodeUnit, Config, HuntError, InputError, Report};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const FIRST: &str = "def first(items)\n  # FIXME: callers pass empty lists\n  items[0]\nend\n";
const GUARD_PATCH: &str = "```diff\n--- a/a.rb\n+++ b/a.rb\n@@ -2,2 +2,3 @@\n   # FIXME: callers pass empty lists\n+  return nil if items.empty?\n   items[0]\n```\nGuards H1 before the lookup flagged next to BH004.";

#[derive(Clone)]
enum Script {
    Reply(&'static str),
    Hang,
    Fail(ProviderErrorKind),
}

struct MockProvider {
    scripts: HashMap<&'static str, Script>,
    calls: AtomicUsize,
}

impl MockProvider {
    fn new(scripts: Vec<(&'static str, Script)>) -> Self {
        Self {
            scripts: scripts.into_iter().collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl ModelProvider for MockProvider {
    fn send<'a>(
        &'a self,
        _prompt: &'a str,
        model_id: &'a str,
        _timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReply, ProviderError>> + Send + 'a>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.get(model_id).cloned().unwrap_or(Script::Hang);
        Box::pin(async move {
            match script {
                Script::Reply(text) => Ok(ProviderReply {
                    text: text.to_string(),
                    usage: Usage {
                        tokens_in: 100,
                        tokens_out: 20,
                    },
                }),
                Script::Fail(kind) => Err(ProviderError::new(kind, "scripted failure")),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(ProviderError::new(ProviderErrorKind::Network, "unreachable"))
                }
            }
        })
    }
}

struct Approve;

impl HumanGate for Approve {
    fn request<'a>(
        &'a self,
        _decision: &'a Decision,
        _report: &'a Report,
        _diff: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<HumanAnswer>> + Send + 'a>> {
        Box::pin(async { Some(HumanAnswer::Approve) })
    }
}

fn participant(id: &str, priority: u32) -> Participant {
    Participant {
        id: id.to_string(),
        model_id: id.to_string(),
        priority,
        timeout: Duration::from_millis(200),
    }
}

fn ruby_unit(src: &str) -> CodeUnit {
    CodeUnit::new(src, Some(PathBuf::from("a.rb")), Config::default().max_input_bytes).unwrap()
}

fn test_config() -> Config {
    Config {
        worker_count: 2,
        human_wait_secs: 1,
        ..Config::default()
    }
}

fn promoted(report: &Report) -> Vec<ProposalSkeleton> {
    report
        .bug_hunt
        .as_ref()
        .map(|h| h.promoted().into_iter().cloned().collect())
        .unwrap_or_default()
}

#[test]
fn scenario_a_clean_unit_has_no_sub_report() {
    let analyzer = Analyzer::with_config(Arc::new(Config::default()));
    let unit = CodeUnit::new("def hello; puts 'hi'; end", None, 1024).unwrap();
    let report = analyzer.analyze(&unit, false).unwrap();
    assert!(report.violations.is_empty());
    assert!(report.bug_hunt.is_none());

    let json = serde_json::to_value(&report).unwrap();
    assert!(json.get("bug_hunt").is_none());
}

#[test]
fn scenario_b_oversized_input_is_refused() {
    let config = Config::default();
    let source = "def hello; puts 'hi'; end".repeat(2000);
    let err = CodeUnit::new(source, None, config.max_input_bytes).unwrap_err();
    match err {
        InputError::SizeExceeded { size, limit } => {
            assert_eq!(size, 50_000);
            assert_eq!(limit, config.max_input_bytes);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn scenario_c_refactor_row() {
    assert_eq!(decide(ActionKind::Refactor, RiskLevel::Low), Outcome::Apply);
    assert_eq!(decide(ActionKind::Refactor, RiskLevel::High), Outcome::Ask);
}

#[tokio::test]
async fn scenario_d_disjoint_hunks_survive_a_timeout() {
    let unit = ruby_unit(FIRST);
    let analyzer = Analyzer::with_config(Arc::new(Config::default()));
    let report = analyzer.analyze(&unit, false).unwrap();
    let skeletons = promoted(&report);
    assert!(!skeletons.is_empty());

    let provider = MockProvider::new(vec![
        ("slow", Script::Hang),
        (
            "guard",
            Script::Reply("```diff\n--- a/a.rb\n+++ b/a.rb\n@@ -1,1 +1,2 @@\n def first(items)\n+  return nil if items.empty?\n```\nCovers H1."),
        ),
        (
            "comment",
            Script::Reply("```diff\n--- a/a.rb\n+++ b/a.rb\n@@ -2,1 +2,1 @@\n-  # FIXME: callers pass empty lists\n+  # callers may pass empty lists\n```\nResolves BH004."),
        ),
    ]);
    let chamber = Chamber::new(
        vec![participant("slow", 0), participant("guard", 1), participant("comment", 2)],
        Arc::new(provider),
    );

    let deliberation = chamber
        .deliberate(&report, &skeletons, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(deliberation.outcomes.len(), 3);
    assert!(matches!(
        &deliberation.outcomes[0],
        ParticipantOutcome::TimedOut { participant_id } if participant_id == "slow"
    ));
    assert_eq!(deliberation.successes(), 2);
    assert_eq!(deliberation.winners.len(), 2);
    assert_eq!(deliberation.patch.len(), 1);
    assert_eq!(deliberation.patch[0].hunks.len(), 2);

    let patched = apply_diff(unit.source(), &deliberation.patch[0]).unwrap();
    assert_eq!(
        patched,
        "def first(items)\n  return nil if items.empty?\n  # callers may pass empty lists\n  items[0]\nend\n"
    );
}

#[test]
fn scenario_e_third_consecutive_failure_requires_a_human() {
    let dir = tempdir().unwrap();
    let config = Arc::new(Config::default());
    let unit = ruby_unit("def greet(name)\n  # FIXME: localize\n  puts name\nend\n");

    // One store per session: the streak has to survive reopening
    for session in 1..=3u32 {
        let store = Arc::new(SessionStore::open(dir.path()).unwrap());
        let ladder = Arc::new(EscalationLadder::new(config.repeat_failure_threshold, store));
        let pipeline = bughunt::pipeline::PhasePipeline::new(
            config.clone(),
            Arc::new(bughunt::catalog::PatternCatalog::new()),
            ladder.clone(),
        );
        let report = Analyzer::new(pipeline).analyze(&unit, false).unwrap();
        assert!(!report.human_escalation_required);
        assert!(report.verification_failed());

        let verdict = ladder.record_verification(&unit, false).unwrap();
        assert_eq!(verdict.requires_human(), session == 3, "session {session}");
    }

    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let ladder = Arc::new(EscalationLadder::new(config.repeat_failure_threshold, store));
    let pipeline = bughunt::pipeline::PhasePipeline::new(
        config,
        Arc::new(bughunt::catalog::PatternCatalog::new()),
        ladder,
    );
    let report = Analyzer::new(pipeline).analyze(&unit, false).unwrap();
    assert!(report.human_escalation_required);
}

#[tokio::test]
async fn no_quorum_pauses_the_unit() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let provider = MockProvider::new(vec![
        ("a", Script::Fail(ProviderErrorKind::Server)),
        ("b", Script::Reply("looks fine to me")),
    ]);
    let chamber = Arc::new(Chamber::new(
        vec![participant("a", 0), participant("b", 1)],
        Arc::new(provider),
    ));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store.clone(), Arc::new(Approve));

    let outcomes = engine
        .run(vec![ruby_unit(FIRST)], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcomes[0].stop, StopReason::Paused);
    assert!(!outcomes[0].changed);
    assert_eq!(outcomes[0].cycles[0].failed_outcomes.len(), 2);

    let record = store.load_record(outcomes[0].session_id.as_ref().unwrap()).unwrap();
    assert_eq!(record.status, SessionStatus::Paused);
}

#[tokio::test]
async fn approved_patch_is_applied_then_unfixable_marker_escalates() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let provider = Arc::new(MockProvider::new(vec![("m", Script::Reply(GUARD_PATCH))]));
    let chamber = Arc::new(Chamber::new(vec![participant("m", 0)], provider.clone()));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store.clone(), Arc::new(Approve));

    let outcomes = engine
        .run(vec![ruby_unit(FIRST)], CancellationToken::new())
        .await
        .unwrap();
    let outcome = &outcomes[0];

    let first = &outcome.cycles[0];
    assert!(first.applied);
    assert_eq!(first.resolved, 1);
    assert_eq!(first.introduced, 0);
    let decision = first.decision.unwrap();
    assert_eq!(decision.action_kind, ActionKind::BugFix);
    assert_eq!(decision.outcome, Outcome::Ask);
    assert!(outcome.changed);
    assert!(outcome.source.contains("return nil if items.empty?"));

    // The FIXME has no guard template, so later cycles fail verification
    assert_eq!(outcome.stop, StopReason::HumanEscalation);
    assert_eq!(outcome.cycles.len(), 4);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

    let record = store.load_record(outcome.session_id.as_ref().unwrap()).unwrap();
    assert_eq!(record.status, SessionStatus::Escalated);
    assert_eq!(record.payload["cycles"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn unanswered_question_pauses() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let provider = MockProvider::new(vec![("m", Script::Reply(GUARD_PATCH))]);
    let chamber = Arc::new(Chamber::new(vec![participant("m", 0)], Arc::new(provider)));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store, Arc::new(Unattended));

    let outcomes = engine
        .run(vec![ruby_unit(FIRST)], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcomes[0].stop, StopReason::Paused);
    assert!(!outcomes[0].changed);
    assert_eq!(outcomes[0].cycles[0].answer, None);
}

#[tokio::test]
async fn cancelled_run_persists_interrupted_sessions() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let chamber = Arc::new(Chamber::new(
        vec![participant("m", 0)],
        Arc::new(MockProvider::new(vec![])),
    ));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store.clone(), Arc::new(Approve));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcomes = engine
        .run(vec![ruby_unit(FIRST), ruby_unit("x = 1\n")], cancel)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert_eq!(outcome.stop, StopReason::Interrupted);
        let record = store.load_record(outcome.session_id.as_ref().unwrap()).unwrap();
        assert_eq!(record.status, SessionStatus::Interrupted);
    }
}

#[tokio::test]
async fn clean_units_stop_immediately_in_queue_order() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let chamber = Arc::new(Chamber::new(
        vec![participant("m", 0)],
        Arc::new(MockProvider::new(vec![])),
    ));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store, Arc::new(Approve));

    let queue: Vec<CodeUnit> = (0..5)
        .map(|i| {
            CodeUnit::new(
                format!("def hello_{i}; puts 'hi'; end\n"),
                Some(PathBuf::from(format!("h{i}.rb"))),
                1024,
            )
            .unwrap()
        })
        .collect();
    let outcomes = engine.run(queue, CancellationToken::new()).await.unwrap();
    let names: Vec<&str> = outcomes.iter().map(|o| o.unit.as_str()).collect();
    assert_eq!(names, vec!["h0.rb", "h1.rb", "h2.rb", "h3.rb", "h4.rb"]);
    assert!(outcomes.iter().all(|o| o.stop == StopReason::Clean && o.cycles.is_empty()));
}

#[tokio::test]
async fn persistence_failure_aborts_the_run() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path().join("store")).unwrap());
    std::fs::remove_dir_all(dir.path().join("store")).unwrap();
    std::fs::write(dir.path().join("store"), "not a directory").unwrap();

    let chamber = Arc::new(Chamber::new(
        vec![participant("m", 0)],
        Arc::new(MockProvider::new(vec![])),
    ));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store, Arc::new(Approve));
    let err = engine
        .run(vec![ruby_unit("def hello; puts 'hi'; end\n")], CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HuntError::Persistence(_)));
}

#[tokio::test]
async fn store_lock_contention_does_not_stall_timers() {
    let dir = tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path()).unwrap());
    let held = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(dir.path().join(".lock"))
        .unwrap();
    fs2::FileExt::lock_exclusive(&held).unwrap();
    let release = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(400));
        fs2::FileExt::unlock(&held).unwrap();
    });

    let chamber = Arc::new(Chamber::new(
        vec![participant("m", 0)],
        Arc::new(MockProvider::new(vec![])),
    ));
    let engine = ConvergenceLoop::new(Arc::new(test_config()), chamber, store, Arc::new(Approve));
    let ticker = async {
        let start = Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        start.elapsed()
    };

    let (waited, outcomes) = tokio::join!(
        ticker,
        engine.run(vec![ruby_unit("def hello; puts 'hi'; end\n")], CancellationToken::new())
    );
    release.join().unwrap();
    assert!(waited < Duration::from_millis(300), "timer waited {waited:?}");
    assert_eq!(outcomes.unwrap()[0].stop, StopReason::Clean);
}
