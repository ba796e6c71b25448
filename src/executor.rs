//! C4 Agent Executor — runs the agent subprocess in a workspace, captures
//! output, derives a [`Signal`], samples RSS (`SPEC_FULL.md` §4.4).

use std::io::Read as _;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use wait_timeout::ChildExt as _;

use crate::error::{DroverError, Result};
use crate::model::{EpicId, TaskId};

/// Classification of an agent run that drives backpressure (`spec.md`
/// GLOSSARY "Signal").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ok,
    RateLimited,
    SlowResponse,
    ApiError,
}

/// Derives a [`Signal`] from an agent run's raw output and timing. The
/// default implementation ([`TextMarkerClassifier`]) string-matches the
/// agent's stdout/stderr, which the spec calls out as fragile (§9 open
/// question (b)); this trait is the seam a future structured-protocol
/// executor would satisfy instead.
pub trait SignalClassifier: Send + Sync {
    fn classify(&self, output: &str, wall_time: Duration, exit_status: Option<ExitStatus>) -> Signal;
}

/// Literal phrases indicating the upstream agent hit a rate limit
/// (`spec.md` §4.4 "explicit upstream-rate-limit markers").
pub const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "429",
    "pre-flight check is taking longer than expected",
];

pub struct TextMarkerClassifier {
    pub slow_threshold: Duration,
}

impl SignalClassifier for TextMarkerClassifier {
    fn classify(&self, output: &str, wall_time: Duration, exit_status: Option<ExitStatus>) -> Signal {
        let lower = output.to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            return Signal::RateLimited;
        }
        if wall_time > self.slow_threshold {
            return Signal::SlowResponse;
        }
        match exit_status {
            Some(status) if !status.success() => Signal::ApiError,
            _ => Signal::Ok,
        }
    }
}

/// Task fields the executor turns into a prompt (`spec.md` §4.4 "prompt
/// construction").
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub epic_id: Option<EpicId>,
    pub operator_guidance: Option<String>,
}

/// Shared cancellation flag threaded from the scheduler into every worker
/// and down into the agent subprocess (`spec.md` §5).
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub output: String,
    pub duration: Duration,
    pub signal: Signal,
    pub worker_pid: Option<u32>,
    pub peak_rss_bytes: u64,
    pub final_rss_bytes: u64,
    pub err: Option<ExecutorError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    Cancelled,
    Timeout,
    MemoryExceeded,
}

/// Spawns `agent_binary` in `workspace_path`, piping a deterministic prompt
/// built from `task` on stdin. Honors `cancel` and `deadline`.
pub struct AgentExecutor {
    agent_binary: std::path::PathBuf,
    classifier: Arc<dyn SignalClassifier>,
    extra_env: Vec<(String, String)>,
    memory_ceiling_bytes: Option<u64>,
}

impl AgentExecutor {
    #[must_use]
    pub fn new(agent_binary: std::path::PathBuf, slow_threshold: Duration) -> Self {
        Self {
            agent_binary,
            classifier: Arc::new(TextMarkerClassifier { slow_threshold }),
            extra_env: Vec::new(),
            memory_ceiling_bytes: None,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn SignalClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.extra_env = env;
        self
    }

    /// Terminate the agent subprocess if its RSS ever exceeds `ceiling_bytes`
    /// (`spec.md` §5 "backpressure under memory pressure").
    #[must_use]
    pub fn with_memory_ceiling(mut self, ceiling_bytes: u64) -> Self {
        self.memory_ceiling_bytes = Some(ceiling_bytes);
        self
    }

    /// Run the agent against `task` inside `workspace_path`, returning once
    /// the process exits, is cancelled, exceeds `deadline`, or exceeds its
    /// memory ceiling. `on_spawn` fires once with the child's pid as soon as
    /// it is known, letting the caller register it with a memory tracker
    /// before the process has had any chance to exit.
    pub fn execute(
        &self,
        workspace_path: &Path,
        task: &ExecutionTask,
        deadline: Duration,
        cancel: &CancelToken,
        on_spawn: impl FnOnce(u32),
    ) -> Result<ExecutionOutcome> {
        let prompt = build_prompt(task);
        let start = Instant::now();

        let mut command = Command::new(&self.agent_binary);
        command
            .current_dir(workspace_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &self.extra_env {
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| DroverError::WorkspaceError {
            command: self.agent_binary.display().to_string(),
            stderr: e.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            use std::io::Write as _;
            let _ = stdin.write_all(prompt.as_bytes());
        }

        let pid = child.id();
        if let Some(p) = pid {
            on_spawn(p);
        }
        let rss_peak = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let rss_final = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let sampler_stop = Arc::new(AtomicBool::new(false));
        let sampler = spawn_rss_sampler(pid, Arc::clone(&rss_peak), Arc::clone(&rss_final), Arc::clone(&sampler_stop));

        let mut remaining = deadline;
        let poll = Duration::from_millis(200);
        let status = loop {
            if cancel.is_cancelled() {
                terminate(&mut child);
                sampler_stop.store(true, Ordering::SeqCst);
                let _ = sampler.join();
                let output = drain_output(&mut child);
                return Ok(ExecutionOutcome {
                    success: false,
                    output,
                    duration: start.elapsed(),
                    signal: Signal::ApiError,
                    worker_pid: pid,
                    peak_rss_bytes: rss_peak.load(Ordering::SeqCst),
                    final_rss_bytes: rss_final.load(Ordering::SeqCst),
                    err: Some(ExecutorError::Cancelled),
                });
            }
            if self.memory_ceiling_bytes.is_some_and(|ceiling| rss_peak.load(Ordering::SeqCst) > ceiling) {
                terminate(&mut child);
                sampler_stop.store(true, Ordering::SeqCst);
                let _ = sampler.join();
                let output = drain_output(&mut child);
                return Ok(ExecutionOutcome {
                    success: false,
                    output,
                    duration: start.elapsed(),
                    signal: Signal::ApiError,
                    worker_pid: pid,
                    peak_rss_bytes: rss_peak.load(Ordering::SeqCst),
                    final_rss_bytes: rss_final.load(Ordering::SeqCst),
                    err: Some(ExecutorError::MemoryExceeded),
                });
            }
            let step = poll.min(remaining);
            match child.wait_timeout(step).map_err(DroverError::Io)? {
                Some(status) => break Some(status),
                None => {
                    remaining = remaining.saturating_sub(step);
                    if remaining.is_zero() {
                        break None;
                    }
                }
            }
        };

        sampler_stop.store(true, Ordering::SeqCst);
        let _ = sampler.join();

        let Some(status) = status else {
            terminate(&mut child);
            let output = drain_output(&mut child);
            return Ok(ExecutionOutcome {
                success: false,
                output,
                duration: start.elapsed(),
                signal: Signal::ApiError,
                worker_pid: pid,
                peak_rss_bytes: rss_peak.load(Ordering::SeqCst),
                final_rss_bytes: rss_final.load(Ordering::SeqCst),
                err: Some(ExecutorError::Timeout),
            });
        };

        let output = drain_output(&mut child);
        let wall_time = start.elapsed();
        let signal = self.classifier.classify(&output, wall_time, Some(status));
        Ok(ExecutionOutcome {
            success: status.success() && signal == Signal::Ok,
            output,
            duration: wall_time,
            signal,
            worker_pid: pid,
            peak_rss_bytes: rss_peak.load(Ordering::SeqCst),
            final_rss_bytes: rss_final.load(Ordering::SeqCst),
            err: None,
        })
    }
}

fn drain_output(child: &mut std::process::Child) -> String {
    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        let _ = stdout.read_to_string(&mut out);
    }
    let mut err = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut err);
    }
    if !err.is_empty() {
        eprint!("{err}");
        out.push_str(&err);
    }
    out
}

/// SIGTERM, escalating to SIGKILL after a short grace period, mirroring
/// the `signal-hook`/`nix` process-management idiom used elsewhere in this
/// corpus for bounding a blocking child-process wait.
fn terminate(child: &mut std::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM);
        }
        if child.wait_timeout(Duration::from_secs(3)).ok().flatten().is_none() {
            let _ = child.kill();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
}

fn spawn_rss_sampler(
    pid: Option<u32>,
    peak: Arc<std::sync::atomic::AtomicU64>,
    last: Arc<std::sync::atomic::AtomicU64>,
    stop: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let Some(pid) = pid else { return };
        let mut system = System::new();
        while !stop.load(Ordering::SeqCst) {
            system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
            if let Some(process) = system.process(Pid::from_u32(pid)) {
                let rss = process.memory();
                last.store(rss, Ordering::SeqCst);
                peak.fetch_max(rss, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    })
}

fn build_prompt(task: &ExecutionTask) -> String {
    let mut prompt = format!("Task: {}\n\n{}\n", task.title, task.description);
    if let Some(epic) = &task.epic_id {
        prompt.push_str(&format!("\nEpic: {epic}\n"));
    }
    if let Some(guidance) = &task.operator_guidance {
        prompt.push_str(&format!("\nOperator guidance: {guidance}\n"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ExecutionTask {
        ExecutionTask {
            id: TaskId::new("t1").unwrap(),
            title: "Do the thing".to_owned(),
            description: "Details here".to_owned(),
            epic_id: None,
            operator_guidance: None,
        }
    }

    #[test]
    fn prompt_is_deterministic() {
        let t = task();
        assert_eq!(build_prompt(&t), build_prompt(&t));
        assert!(build_prompt(&t).contains("Do the thing"));
    }

    #[test]
    fn classifier_detects_rate_limit_marker() {
        let c = TextMarkerClassifier {
            slow_threshold: Duration::from_secs(10),
        };
        let signal = c.classify("error: rate limit exceeded", Duration::from_millis(10), None);
        assert_eq!(signal, Signal::RateLimited);
    }

    #[test]
    fn classifier_detects_slow_response() {
        let c = TextMarkerClassifier {
            slow_threshold: Duration::from_millis(1),
        };
        let signal = c.classify("all fine", Duration::from_secs(1), None);
        assert_eq!(signal, Signal::SlowResponse);
    }

    #[test]
    fn classifier_detects_api_error_on_nonzero_exit() {
        use std::os::unix::process::ExitStatusExt as _;
        let c = TextMarkerClassifier {
            slow_threshold: Duration::from_secs(10),
        };
        let status = ExitStatus::from_raw(256); // exit code 1
        let signal = c.classify("oops", Duration::from_millis(1), Some(status));
        assert_eq!(signal, Signal::ApiError);
    }

    #[test]
    fn classifier_defaults_to_ok() {
        let c = TextMarkerClassifier {
            slow_threshold: Duration::from_secs(10),
        };
        let signal = c.classify("all good", Duration::from_millis(1), None);
        assert_eq!(signal, Signal::Ok);
    }

    #[test]
    fn execute_runs_real_command_and_classifies_ok() {
        let executor = AgentExecutor::new(std::path::PathBuf::from("true"), Duration::from_secs(10));
        let dir = tempfile::tempdir().unwrap();
        let outcome = executor
            .execute(dir.path(), &task(), Duration::from_secs(5), &CancelToken::new(), |_| {})
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.signal, Signal::Ok);
    }

    #[test]
    fn execute_reports_cancellation() {
        let executor = AgentExecutor::new(std::path::PathBuf::from("sleep"), Duration::from_secs(30));
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = executor
            .execute(dir.path(), &task(), Duration::from_secs(30), &cancel, |_| {})
            .unwrap();
        assert_eq!(outcome.err, Some(ExecutorError::Cancelled));
    }

    #[test]
    fn execute_invokes_on_spawn_with_pid() {
        let executor = AgentExecutor::new(std::path::PathBuf::from("true"), Duration::from_secs(10));
        let dir = tempfile::tempdir().unwrap();
        let seen_pid = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));
        let seen_pid2 = std::sync::Arc::clone(&seen_pid);
        executor
            .execute(dir.path(), &task(), Duration::from_secs(5), &CancelToken::new(), move |pid| {
                seen_pid2.store(u64::from(pid), Ordering::SeqCst);
            })
            .unwrap();
        assert!(seen_pid.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn execute_terminates_process_exceeding_memory_ceiling() {
        // `yes` keeps producing output (and thus keeps running) without any
        // arguments, unlike `sleep`, which exits near-instantly if given none.
        let executor = AgentExecutor::new(std::path::PathBuf::from("yes"), Duration::from_secs(30))
            .with_memory_ceiling(1); // 1 byte: any running process exceeds this
        let dir = tempfile::tempdir().unwrap();
        let outcome = executor
            .execute(dir.path(), &task(), Duration::from_secs(30), &CancelToken::new(), |_| {})
            .unwrap();
        assert_eq!(outcome.err, Some(ExecutorError::MemoryExceeded));
    }
}
