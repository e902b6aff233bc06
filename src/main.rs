use anyhow::{anyhow, Context, Result};
use bughunt::autonomy::Decision;
use bughunt::chamber::{Chamber, OpenRouterProvider};
use bughunt::convergence::{ConvergenceLoop, HumanAnswer, HumanGate, Unattended, UnitOutcome};
use bughunt::store::SessionStore;
use bughunt::{logging, Analyzer, CodeUnit, Config, Report};
use clap::{Args, Parser, Subcommand};
use rayon::prelude::*;
use std::future::Future;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Directories never worth walking into
const SKIP_DIRS: [&str; 6] = [".git", "target", "node_modules", "vendor", "dist", ".bughunt"];

#[derive(Parser, Debug)]
#[command(
    name = "bughunt",
    about = "Deep code diagnostics with multi-model deliberation and risk-gated autonomy",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Analyze files and print their reports (no model calls)
    Analyze(AnalyzeArgs),
    /// Analyze, deliberate and patch until findings stop improving
    Hunt(HuntArgs),
    /// Inspect persisted sessions
    #[command(subcommand)]
    Session(SessionCommand),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Files or directories to analyze
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    /// Run all eight phases even when the shallow pass finds nothing
    #[arg(long)]
    deep: bool,
    /// Print full JSON reports instead of a summary
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct HuntArgs {
    #[arg(required = true)]
    paths: Vec<PathBuf>,
    #[arg(long)]
    deep: bool,
    /// Write patched sources back to disk
    #[arg(long)]
    write: bool,
    /// Ask on the terminal when a patch needs confirmation
    #[arg(long)]
    interactive: bool,
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    /// List sessions, newest first
    List,
    /// Print one session as JSON
    Show { id: String },
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config = Config::load();
    config.validate()?;
    let config = Arc::new(config);

    match cli.command {
        Commands::Analyze(args) => analyze(config, args),
        Commands::Hunt(args) => {
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(hunt(config, args))
        }
        Commands::Session(cmd) => session(&config, cmd),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&*config)?);
            Ok(())
        }
    }
}

fn analyze(config: Arc<Config>, args: AnalyzeArgs) -> Result<()> {
    let files = collect_files(&args.paths);
    if files.is_empty() {
        return Err(anyhow!("no source files found"));
    }
    let analyzer = Analyzer::with_config(config.clone());

    let results: Vec<(PathBuf, Result<Report>)> = files
        .into_par_iter()
        .map(|path| {
            let report = load_unit(&path, config.max_input_bytes)
                .and_then(|unit| analyzer.analyze(&unit, args.deep).map_err(Into::into));
            (path, report)
        })
        .collect();

    if args.json {
        let reports: Vec<&Report> = results.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    for (path, result) in &results {
        match result {
            Ok(report) if !args.json => print_summary(report),
            Ok(_) => {}
            Err(e) => eprintln!("{}: {:#}", path.display(), e),
        }
    }
    Ok(())
}

async fn hunt(config: Arc<Config>, args: HuntArgs) -> Result<()> {
    let provider = OpenRouterProvider::from_env().ok_or_else(|| {
        anyhow!("no API key: set OPENROUTER_API_KEY or store one in the system keychain")
    })?;
    let store = Arc::new(SessionStore::open(config.store_dir())?);
    let chamber = Arc::new(Chamber::from_config(&config, Arc::new(provider)));
    let gate: Arc<dyn HumanGate> = if args.interactive {
        Arc::new(TerminalGate::stdin())
    } else {
        Arc::new(Unattended)
    };

    let mut queue = Vec::new();
    for path in collect_files(&args.paths) {
        match load_unit(&path, config.max_input_bytes) {
            Ok(unit) => queue.push(unit),
            Err(e) => eprintln!("{}: {:#}", path.display(), e),
        }
    }
    if queue.is_empty() {
        return Err(anyhow!("no source files found"));
    }

    let mut config = (*config).clone();
    config.force_bug_hunting |= args.deep;
    let engine = ConvergenceLoop::new(Arc::new(config), chamber, store.clone(), gate);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("interrupted; saving sessions");
            on_signal.cancel();
        }
    });

    let outcomes = engine.run(queue, cancel).await?;
    for outcome in &outcomes {
        print_outcome(outcome);
        if args.write && outcome.changed {
            std::fs::write(&outcome.unit, &outcome.source)
                .with_context(|| format!("failed to write {}", outcome.unit))?;
        }
    }
    Ok(())
}

fn session(config: &Config, cmd: SessionCommand) -> Result<()> {
    let store = SessionStore::open(config.store_dir())?;
    match cmd {
        SessionCommand::List => {
            for s in store.list_sessions()? {
                println!(
                    "{}  {:<11}  {}",
                    s.id,
                    s.status.label(),
                    s.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        SessionCommand::Show { id } => {
            let record = store.load_record(&id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }
    Ok(())
}

fn collect_files(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in paths {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name) || name.starts_with('.'))
        });
        for entry in walker.filter_map(|e| e.ok()) {
            if entry.file_type().is_file()
                && bughunt::unit::Language::from_path(entry.path()) != bughunt::unit::Language::Unknown
            {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

fn load_unit(path: &Path, max_bytes: usize) -> Result<CodeUnit> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(CodeUnit::from_bytes(&bytes, Some(path.to_path_buf()), max_bytes)?)
}

fn print_summary(report: &Report) {
    let depth = if report.bug_hunt.is_some() { "deep" } else { "shallow" };
    println!(
        "{} ({}): {} violations, {} suggestions",
        report.unit,
        depth,
        report.violations.len(),
        report.suggestions.len()
    );
    for v in &report.violations {
        println!("  {} [{}] {}: {}", v.location, v.severity, v.rule_id, v.message);
    }
    if let Some(hunt) = &report.bug_hunt {
        for h in hunt.open_hypotheses() {
            println!("  line {} [{}] {}: {}", h.line, h.severity, h.id, h.challenge);
        }
        for p in hunt.promoted() {
            println!("  fix ready for {}", p.hypothesis_id);
        }
    }
    if report.human_escalation_required {
        println!("  needs human review: repeated verification failures");
    }
}

fn print_outcome(outcome: &UnitOutcome) {
    let applied = outcome.cycles.iter().filter(|c| c.applied).count();
    println!(
        "{}: {} after {} cycles, {} patches applied{}",
        outcome.unit,
        outcome.stop.label(),
        outcome.cycles.len(),
        applied,
        outcome
            .session_id
            .as_ref()
            .map(|id| format!(" (session {})", id))
            .unwrap_or_default()
    );
    if let Some(note) = outcome.cycles.last().map(|c| &c.note).filter(|n| !n.is_empty()) {
        println!("  last cycle: {}", note);
    }
}

/// A line read from the terminal and when it arrived
type Answer = (Instant, String);

/// Asks on stderr and takes answers from one shared stdin reader.
///
/// Questions are asked one at a time. A line typed before the current
/// question was printed belongs to an earlier, abandoned question and is
/// discarded.
struct TerminalGate {
    answers: Mutex<mpsc::UnboundedReceiver<Answer>>,
}

impl TerminalGate {
    fn stdin() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        // A plain thread: a blocking task would hold up runtime shutdown
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send((Instant::now(), line)).is_err() {
                    break;
                }
            }
        });
        Self::from_answers(rx)
    }

    fn from_answers(answers: mpsc::UnboundedReceiver<Answer>) -> Self {
        Self {
            answers: Mutex::new(answers),
        }
    }
}

impl HumanGate for TerminalGate {
    fn request<'a>(
        &'a self,
        decision: &'a Decision,
        report: &'a Report,
        diff: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<HumanAnswer>> + Send + 'a>> {
        Box::pin(async move {
            let mut answers = self.answers.lock().await;
            let mut stderr = std::io::stderr();
            let _ = write!(
                stderr,
                "\n{} needs confirmation ({})\n{}\nApply this patch? [y/N] ",
                report.unit, decision, diff
            );
            let _ = stderr.flush();
            let asked = Instant::now();

            let line = loop {
                let (arrived, line) = answers.recv().await?;
                if arrived >= asked {
                    break line;
                }
            };
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => Some(HumanAnswer::Approve),
                _ => Some(HumanAnswer::Reject),
            }
        })
    }
}
