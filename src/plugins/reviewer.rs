//! Boundary around the external AI judge.
//!
//! The judge is an unreliable subprocess that answers in free text. Everything that can
//! go wrong with it (missing binary, timeout, non-zero exit, unparsable output) becomes
//! a `CarapaceError` inside this module and a needs-human-review verdict outside it:
//! callers go through [`review_or_degrade`], which never fails open and never errors.
//!
//! Output parsing tries, in order: the whole response as JSON, the first fenced code
//! block, the outermost `{...}` span. If none yields a verdict the caller receives the
//! conservative default carrying a truncated excerpt of the raw output.

use crate::core::config::{ReviewerConfig, ReviewerMode};
use crate::core::error::CarapaceError;
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Appended to every prompt so the judge knows the expected answer shape.
pub const RESPONSE_CONTRACT: &str = r#"Respond with a single JSON object and nothing else:
{"verdict": "approved" | "blocked" | "needs_human_review",
 "findings": [{"tier": "...", "severity": "low|medium|high|critical", "description": "...", "suggestion": "..."}],
 "guidance": "what the agent should do next",
 "standards_cited": ["standard entity names you relied on"]}"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Blocked,
    NeedsHumanReview,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Blocked => "blocked",
            Verdict::NeedsHumanReview => "needs_human_review",
        }
    }

    /// Lenient parse of judge/operator spellings (`APPROVED`, `needs-human-review`, `block`).
    pub fn parse(s: &str) -> Option<Self> {
        let norm = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "approved" | "approve" | "pass" | "passed" => Some(Verdict::Approved),
            "blocked" | "block" | "reject" | "rejected" | "issues_found" => Some(Verdict::Blocked),
            "needs_human_review" | "needs_human" | "human_review" | "escalate" => {
                Some(Verdict::NeedsHumanReview)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub severity: String,
    pub description: String,
    #[serde(default, alias = "suggested_remedy", alias = "remedy")]
    pub suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    Decision,
    Plan,
    Completion,
    Holistic,
    Task,
}

impl ReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewKind::Decision => "decision",
            ReviewKind::Plan => "plan",
            ReviewKind::Completion => "completion",
            ReviewKind::Holistic => "holistic",
            ReviewKind::Task => "task",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "decision" => Some(ReviewKind::Decision),
            "plan" => Some(ReviewKind::Plan),
            "completion" => Some(ReviewKind::Completion),
            "holistic" => Some(ReviewKind::Holistic),
            "task" => Some(ReviewKind::Task),
            _ => None,
        }
    }
}

/// Everything the judge sees for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub kind: ReviewKind,
    /// What is under review: a decision id, task id or session id.
    pub subject: String,
    pub prompt: String,
    /// Names of the standards assembled as context.
    pub standards: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictBundle {
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    pub guidance: String,
    pub standards_cited: Vec<String>,
    pub reviewer: String,
}

pub trait DecisionReviewer: Send + Sync {
    fn name(&self) -> &str;

    fn review(
        &self,
        request: &ReviewRequest,
        budget: Duration,
    ) -> Result<VerdictBundle, CarapaceError>;
}

/// The conservative verdict used whenever the judge cannot be trusted to have answered.
pub fn needs_human_review(reviewer: &str, rationale: &str) -> VerdictBundle {
    VerdictBundle {
        verdict: Verdict::NeedsHumanReview,
        findings: Vec::new(),
        guidance: rationale.to_string(),
        standards_cited: Vec::new(),
        reviewer: reviewer.to_string(),
    }
}

/// Call the reviewer and fold every failure into needs-human-review.
pub fn review_or_degrade(
    reviewer: &dyn DecisionReviewer,
    request: &ReviewRequest,
    budget: Duration,
) -> VerdictBundle {
    let started = Instant::now();
    match reviewer.review(request, budget) {
        Ok(bundle) => {
            info!(
                kind = request.kind.as_str(),
                subject = %request.subject,
                verdict = bundle.verdict.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "review completed"
            );
            bundle
        }
        Err(err) => {
            warn!(
                kind = request.kind.as_str(),
                subject = %request.subject,
                error = %err,
                "reviewer failed; escalating to human review"
            );
            let rationale = match &err {
                CarapaceError::ReviewTimeout(secs) => format!(
                    "Automated review timed out after {}s; a human must review this {}.",
                    secs,
                    request.kind.as_str()
                ),
                CarapaceError::ReviewUnavailable(why) => {
                    format!("Automated reviewer unavailable ({}); human review required.", why)
                }
                CarapaceError::UnparsableVerdict(excerpt) => format!(
                    "Automated reviewer returned an unparsable verdict; human review required. Raw excerpt: {}",
                    excerpt
                ),
                other => format!("Automated review failed ({}); human review required.", other),
            };
            needs_human_review(reviewer.name(), &rationale)
        }
    }
}

// --- Output parsing ---

#[derive(Debug, Deserialize)]
struct RawVerdict {
    verdict: String,
    #[serde(default)]
    findings: Vec<Finding>,
    #[serde(default, alias = "rationale", alias = "reasoning")]
    guidance: String,
    #[serde(default, alias = "standards_verified", alias = "standards")]
    standards_cited: Vec<String>,
}

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap());

fn whole_response(raw: &str) -> Option<&str> {
    Some(raw.trim())
}

fn fenced_block(raw: &str) -> Option<&str> {
    FENCED_BLOCK
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

fn brace_span(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn bundle_from_json(candidate: &str, reviewer: &str) -> Option<VerdictBundle> {
    let parsed: RawVerdict = serde_json::from_str(candidate).ok()?;
    let verdict = Verdict::parse(&parsed.verdict)?;
    Some(VerdictBundle {
        verdict,
        findings: parsed.findings,
        guidance: parsed.guidance,
        standards_cited: parsed.standards_cited,
        reviewer: reviewer.to_string(),
    })
}

/// Truncate on a char boundary, marking the cut.
pub fn excerpt(raw: &str, max_chars: usize) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{}…", cut)
}

/// Run the structured strategies in order. Fails with `UnparsableVerdict` carrying an excerpt.
pub fn parse_verdict_output(
    raw: &str,
    reviewer: &str,
    excerpt_chars: usize,
) -> Result<VerdictBundle, CarapaceError> {
    let strategies: [(&str, fn(&str) -> Option<&str>); 3] = [
        ("whole", whole_response),
        ("fenced", fenced_block),
        ("braces", brace_span),
    ];
    for (label, strategy) in strategies {
        if let Some(bundle) = strategy(raw).and_then(|c| bundle_from_json(c, reviewer)) {
            debug!(strategy = label, "verdict parsed");
            return Ok(bundle);
        }
    }
    Err(CarapaceError::UnparsableVerdict(excerpt(raw, excerpt_chars)))
}

/// Structured strategies, then the default verdict with a raw excerpt. Never fails.
pub fn parse_or_default(raw: &str, reviewer: &str, excerpt_chars: usize) -> VerdictBundle {
    match parse_verdict_output(raw, reviewer, excerpt_chars) {
        Ok(bundle) => bundle,
        Err(CarapaceError::UnparsableVerdict(excerpt)) => needs_human_review(
            reviewer,
            &format!(
                "Reviewer output could not be parsed; human review required. Raw excerpt: {}",
                excerpt
            ),
        ),
        Err(other) => needs_human_review(reviewer, &other.to_string()),
    }
}

// --- Implementations ---

/// Runs the judge as a subprocess: prompt on stdin, verdict on stdout.
pub struct CommandReviewer {
    command: String,
    args: Vec<String>,
    excerpt_chars: usize,
}

impl CommandReviewer {
    pub fn new(command: &str, args: &[String], excerpt_chars: usize) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            excerpt_chars,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Drain `source` on its own thread and send the bytes once the pipe closes. A pipe kept
/// open by a grandchild never sends; the receiver bounds the wait.
fn spawn_reader<R: Read + Send + 'static>(
    mut source: R,
    stream: Stream,
    tx: Sender<(Stream, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
}

impl DecisionReviewer for CommandReviewer {
    fn name(&self) -> &str {
        &self.command
    }

    fn review(
        &self,
        request: &ReviewRequest,
        budget: Duration,
    ) -> Result<VerdictBundle, CarapaceError> {
        let start = Instant::now();
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => CarapaceError::ReviewUnavailable(format!(
                    "judge command '{}' not found",
                    self.command
                )),
                _ => CarapaceError::ReviewUnavailable(format!(
                    "failed to start judge '{}': {}",
                    self.command, e
                )),
            })?;

        let prompt = format!("{}\n\n{}", request.prompt, RESPONSE_CONTRACT);
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                let _ = stdin.write_all(prompt.as_bytes());
            });
        }
        let (tx, rx) = mpsc::channel();
        if let Some(out) = child.stdout.take() {
            spawn_reader(out, Stream::Stdout, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_reader(err, Stream::Stderr, tx.clone());
        }
        drop(tx);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() > budget {
                // Kill and reap so a timed-out judge never outlives the call.
                let _ = child.kill();
                let _ = child.wait();
                warn!(command = %self.command, budget_secs = budget.as_secs(), "judge killed after timeout");
                return Err(CarapaceError::ReviewTimeout(budget.as_secs()));
            }
            thread::sleep(Duration::from_millis(25));
        };

        // The judge has exited, but a descendant may still hold its pipes open.
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());
        loop {
            let remaining = budget.saturating_sub(start.elapsed());
            match rx.recv_timeout(remaining) {
                Ok((Stream::Stdout, buf)) => stdout = buf,
                Ok((Stream::Stderr, buf)) => stderr = buf,
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        command = %self.command,
                        budget_secs = budget.as_secs(),
                        "judge output still open when the budget ran out"
                    );
                    return Err(CarapaceError::ReviewTimeout(budget.as_secs()));
                }
            }
        }

        if !status.success() {
            return Err(CarapaceError::ReviewUnavailable(format!(
                "judge exited with {:?}: {}",
                status.code(),
                excerpt(&String::from_utf8_lossy(&stderr), self.excerpt_chars)
            )));
        }

        parse_verdict_output(
            &String::from_utf8_lossy(&stdout),
            &self.command,
            self.excerpt_chars,
        )
    }
}

/// Deterministic reviewer for exercising the surrounding state machines.
pub struct BypassReviewer {
    verdict: Verdict,
    calls: AtomicUsize,
    requests: Mutex<Vec<ReviewRequest>>,
}

impl BypassReviewer {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ReviewRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl DecisionReviewer for BypassReviewer {
    fn name(&self) -> &str {
        "bypass"
    }

    fn review(
        &self,
        request: &ReviewRequest,
        _budget: Duration,
    ) -> Result<VerdictBundle, CarapaceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());
        Ok(VerdictBundle {
            verdict: self.verdict,
            findings: Vec::new(),
            guidance: format!("bypass reviewer: fixed verdict {}", self.verdict.as_str()),
            standards_cited: request.standards.clone(),
            reviewer: "bypass".to_string(),
        })
    }
}

pub fn build_reviewer(config: &ReviewerConfig) -> Result<Arc<dyn DecisionReviewer>, CarapaceError> {
    match config.mode {
        ReviewerMode::Bypass => {
            let verdict = Verdict::parse(&config.bypass_verdict).ok_or_else(|| {
                CarapaceError::ConfigError(format!(
                    "Invalid bypass verdict '{}'",
                    config.bypass_verdict
                ))
            })?;
            Ok(Arc::new(BypassReviewer::new(verdict)))
        }
        ReviewerMode::Command => Ok(Arc::new(CommandReviewer::new(
            &config.command,
            &config.args,
            config.excerpt_chars,
        ))),
    }
}
