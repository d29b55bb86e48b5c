// src/setup.rs
// Setup pipeline: scaffold → change directory → install → start server →
// readiness. Strictly sequential; the first failing step ends the run.

use once_cell::sync::OnceCell;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{split_command, ProjectConfig, SetupConfig};
use crate::error::StepFailure;
use crate::sandbox::{exit_code, Sandbox, UNKNOWN_EXIT};
use crate::terminal::{pipe_to_terminal, pipe_with, Stream, Terminal};
use crate::types::{ServerReady, SetupState, SetupStatus, SpawnOptions};

// Rolling window kept by the readiness scanner.
const SCAN_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetupStep {
    Scaffold,
    ChangeDirectory,
    InstallDependencies,
    StartServer,
    AwaitReadiness,
}

impl SetupStep {
    /// Stage label shown while the step runs.
    pub fn label(self) -> &'static str {
        match self {
            SetupStep::Scaffold => "Creating new project...",
            SetupStep::ChangeDirectory => "Changing to project directory...",
            SetupStep::InstallDependencies => "Installing dependencies (this may take a while)...",
            SetupStep::StartServer => "Starting development server...",
            SetupStep::AwaitReadiness => "Waiting for development server...",
        }
    }

    /// Progress reported when the step begins.
    pub fn checkpoint(self) -> u8 {
        match self {
            SetupStep::Scaffold => 20,
            SetupStep::ChangeDirectory => 45,
            SetupStep::InstallDependencies => 50,
            SetupStep::StartServer | SetupStep::AwaitReadiness => 85,
        }
    }

    fn state(self) -> Option<SetupState> {
        match self {
            SetupStep::Scaffold => Some(SetupState::Scaffolding),
            SetupStep::ChangeDirectory => Some(SetupState::ChangingDirectory),
            SetupStep::InstallDependencies => Some(SetupState::InstallingDependencies),
            SetupStep::StartServer => Some(SetupState::StartingServer),
            SetupStep::AwaitReadiness => None,
        }
    }
}

impl fmt::Display for SetupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SetupStep::Scaffold => "scaffold project",
            SetupStep::ChangeDirectory => "change into project directory",
            SetupStep::InstallDependencies => "install dependencies",
            SetupStep::StartServer => "start development server",
            SetupStep::AwaitReadiness => "wait for server readiness",
        };
        f.write_str(name)
    }
}

/// Publishes `SetupStatus` to any number of observers.
#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<SetupStatus>>,
    trail: Arc<Mutex<Vec<u8>>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        StatusReporter::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SetupStatus::default());
        StatusReporter { tx: Arc::new(tx), trail: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SetupStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SetupStatus {
        self.tx.borrow().clone()
    }

    /// Every progress value reported so far, in order.
    pub fn progress_trail(&self) -> Vec<u8> {
        self.trail.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stage(&self, stage: impl Into<String>) {
        let stage = stage.into();
        debug!(stage = %stage, "stage");
        self.tx.send_modify(|status| status.stage = stage);
    }

    /// 100 is reserved for a ready server; anything else is capped at 99.
    pub fn progress(&self, value: u8) {
        let mut reported = value.min(100);
        self.tx.send_modify(|status| {
            if reported == 100 && !matches!(status.state, SetupState::ServerReady { .. }) {
                reported = 99;
            }
            status.progress = reported;
        });
        self.trail.lock().unwrap_or_else(PoisonError::into_inner).push(reported);
    }

    /// Moves the pipeline state forward; refused transitions are logged and ignored.
    pub fn enter(&self, next: SetupState) -> bool {
        self.tx.send_if_modified(|status| {
            if status.state.can_advance_to(&next) {
                status.state = next.clone();
                true
            } else {
                warn!(from = ?status.state, to = ?next, "ignoring invalid setup transition");
                false
            }
        })
    }

    pub fn fail(&self, reason: &str) {
        self.enter(SetupState::Failed { reason: reason.to_string() });
        self.stage(format!("Setup failed: {}", reason));
    }

    pub fn set_loading(&self, loading: bool) {
        self.tx.send_modify(|status| status.is_loading = loading);
    }

    pub fn set_preview_url(&self, url: &str) {
        let url = url.to_string();
        self.tx.send_modify(|status| status.preview_url = Some(url));
    }

    /// Back to the initial status, for a retried session.
    pub fn reset(&self) {
        self.tx.send_replace(SetupStatus::default());
        self.trail.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Holds the first readiness signal; later ones are ignored.
#[derive(Default)]
pub struct ReadinessLatch {
    cell: OnceCell<ServerReady>,
    notify: Notify,
}

impl ReadinessLatch {
    pub fn new() -> Self {
        ReadinessLatch::default()
    }

    /// Returns true only for the call that won.
    pub fn fire(&self, ready: ServerReady) -> bool {
        let won = self.cell.set(ready).is_ok();
        if won {
            self.notify.notify_waiters();
        }
        won
    }

    pub fn get(&self) -> Option<&ServerReady> {
        self.cell.get()
    }

    pub async fn wait(&self) -> ServerReady {
        loop {
            let notified = self.notify.notified();
            if let Some(ready) = self.cell.get() {
                return ready.clone();
            }
            notified.await;
        }
    }
}

/// Watches server output for the "running at <url>" line. Chunks may split
/// the line anywhere, so a bounded tail of recent output is kept.
pub struct ReadyScanner {
    marker: String,
    pattern: Regex,
    window: String,
}

impl ReadyScanner {
    pub fn new(marker: &str, pattern: Regex) -> Self {
        ReadyScanner { marker: marker.to_string(), pattern, window: String::new() }
    }

    pub fn feed(&mut self, chunk: &str) -> Option<ServerReady> {
        self.window.push_str(chunk);
        if self.window.len() > SCAN_WINDOW {
            let mut cut = self.window.len() - SCAN_WINDOW;
            while !self.window.is_char_boundary(cut) {
                cut += 1;
            }
            self.window.drain(..cut);
        }

        let start = if self.marker.is_empty() {
            0
        } else {
            self.window.find(&self.marker)?
        };
        let captures = self.pattern.captures(&self.window[start..])?;
        let url = captures.get(0)?.as_str().to_string();
        let port = captures
            .get(1)
            .and_then(|port| port.as_str().parse::<u16>().ok())
            .unwrap_or(0);
        self.window.clear();
        Some(ServerReady { port, url })
    }
}

/// A dev server that reached readiness. Dropping it stops streaming its output.
pub struct RunningServer {
    ready: ServerReady,
    exit: oneshot::Receiver<i32>,
    input: Option<mpsc::UnboundedSender<String>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn ready(&self) -> &ServerReady {
        &self.ready
    }

    pub fn url(&self) -> &str {
        &self.ready.url
    }

    pub fn send_input(&self, data: &str) -> bool {
        self.input.as_ref().map_or(false, |input| input.send(data.to_string()).is_ok())
    }

    /// Waits for the server process to stop.
    pub async fn wait(&mut self) -> i32 {
        (&mut self.exit).await.unwrap_or(UNKNOWN_EXIT)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

pub struct SetupOrchestrator {
    sandbox: Arc<dyn Sandbox>,
    terminal: Arc<dyn Terminal>,
    reporter: StatusReporter,
    project: ProjectConfig,
    setup: SetupConfig,
    ready_pattern: Regex,
}

impl SetupOrchestrator {
    pub fn new(
        sandbox: Arc<dyn Sandbox>,
        terminal: Arc<dyn Terminal>,
        reporter: StatusReporter,
        project: ProjectConfig,
        setup: SetupConfig,
    ) -> Result<Self, regex::Error> {
        let ready_pattern = Regex::new(&setup.ready_pattern)?;
        Ok(SetupOrchestrator { sandbox, terminal, reporter, project, setup, ready_pattern })
    }

    /// Runs every step in order. `on_ready` runs once, as soon as the server is
    /// reachable and before the settle delay.
    pub async fn run<F, Fut>(&self, on_ready: F) -> Result<RunningServer, StepFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        info!(project = %self.project.name, "starting project setup");
        match self.run_steps(on_ready).await {
            Ok(server) => {
                info!(url = %server.url(), "project setup complete");
                Ok(server)
            }
            Err(failure) => {
                error!(step = %failure.step, reason = %failure.reason, "project setup failed");
                self.terminal.writeln_error(&format!("\r\nSetup error: {}", failure));
                self.reporter.fail(&failure.to_string());
                Err(failure)
            }
        }
    }

    async fn run_steps<F, Fut>(&self, on_ready: F) -> Result<RunningServer, StepFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        self.scaffold().await?;
        self.change_directory().await?;
        self.install_dependencies().await?;
        let server = self.start_server().await?;

        let url = server.url().to_string();
        self.reporter.enter(SetupState::ServerReady { url: url.clone() });
        self.reporter.set_preview_url(&url);
        self.reporter.stage("Loading website...");
        self.reporter.progress(95);
        self.terminal.writeln(&format!("\r\nServer started successfully at {}", url));
        on_ready().await;

        tokio::time::sleep(self.setup.settle_delay()).await;
        self.reporter.stage("Setup complete!");
        self.reporter.progress(100);
        self.reporter.set_loading(false);
        Ok(server)
    }

    fn begin(&self, step: SetupStep) {
        info!(step = %step, "setup step started");
        if let Some(state) = step.state() {
            self.reporter.enter(state);
        }
        self.reporter.stage(step.label());
        self.reporter.progress(step.checkpoint());
        self.terminal.writeln(&format!("\r\n{}", step.label()));
    }

    fn failure(&self, step: SetupStep, reason: impl Into<String>) -> StepFailure {
        StepFailure { step, reason: reason.into() }
    }

    async fn spawn(
        &self,
        step: SetupStep,
        command: &[String],
        cwd: Option<String>,
    ) -> Result<crate::sandbox::SandboxProcess, StepFailure> {
        let (program, args) =
            split_command(command).ok_or_else(|| self.failure(step, "no command configured"))?;
        self.sandbox.spawn(program, args, SpawnOptions { cwd }).await.map_err(|e| {
            self.terminal.writeln(&format!("\r\nError: {}", e));
            self.failure(step, e.to_string())
        })
    }

    // Spawns `command`, streams both outputs, waits for exit and for both pipes to drain.
    async fn run_to_exit<F>(
        &self,
        step: SetupStep,
        command: &[String],
        cwd: Option<String>,
        inspect: F,
    ) -> Result<i32, StepFailure>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let process = self.spawn(step, command, cwd).await?;
        let stdout = pipe_with(process.output, self.terminal.clone(), Stream::Stdout, inspect);
        let stderr = pipe_to_terminal(process.stderr, self.terminal.clone(), Stream::Stderr);
        let code = exit_code(process.exit).await;
        self.join_pipes([stdout, stderr]).await;
        debug!(step = %step, code, "process exited");
        Ok(code)
    }

    async fn join_pipes<const N: usize>(&self, pipes: [JoinHandle<()>; N]) {
        for pipe in pipes {
            if let Err(e) = pipe.await {
                warn!(error = %e, "output pipe failed");
                self.terminal.writeln_error(&format!("\r\nStream error: {}", e));
            }
        }
    }

    async fn scaffold(&self) -> Result<(), StepFailure> {
        let step = SetupStep::Scaffold;
        self.begin(step);
        let code = self.run_to_exit(step, &self.project.scaffold, None, |_| {}).await?;
        if code != 0 {
            self.terminal
                .writeln(&format!("\r\nError creating project (exit code: {})", code));
            return Err(self.failure(step, format!("exit code {}", code)));
        }
        self.terminal.writeln("\r\nProject created successfully!");
        Ok(())
    }

    // Processes are spawned with an explicit cwd, so this only verifies that
    // the scaffold produced the project directory.
    async fn change_directory(&self) -> Result<(), StepFailure> {
        let step = SetupStep::ChangeDirectory;
        self.begin(step);
        let project_dir = self.project.project_dir();
        match self.sandbox.read_dir(&project_dir).await {
            Ok(_) => {
                debug!(path = %project_dir, "project directory present");
                Ok(())
            }
            Err(e) => {
                self.terminal.writeln(&format!("\r\nError changing directory: {}", e));
                Err(self.failure(step, e.to_string()))
            }
        }
    }

    async fn install_dependencies(&self) -> Result<(), StepFailure> {
        let step = SetupStep::InstallDependencies;
        self.begin(step);
        let reporter = self.reporter.clone();
        let mut bumped = false;
        let code = self
            .run_to_exit(step, &self.project.install, Some(self.project.project_dir()), move |chunk| {
                if !bumped && chunk.contains("added") {
                    bumped = true;
                    reporter.progress(75);
                }
            })
            .await?;
        if code != 0 {
            self.terminal
                .writeln(&format!("\r\nError installing dependencies (exit code: {})", code));
            return Err(self.failure(step, format!("exit code {}", code)));
        }
        self.terminal.writeln("\r\nDependencies installed successfully!");
        self.reporter.progress(80);
        Ok(())
    }

    async fn start_server(&self) -> Result<RunningServer, StepFailure> {
        // Subscribe before the spawn so an early announcement is not missed.
        let mut port_events = self.sandbox.on_server_ready();
        let step = SetupStep::StartServer;
        self.begin(step);
        let mut process = self.spawn(step, &self.project.start, Some(self.project.project_dir())).await?;

        let latch = Arc::new(ReadinessLatch::new());

        let mut scanner = ReadyScanner::new(&self.setup.ready_marker, self.ready_pattern.clone());
        let output_latch = latch.clone();
        let stdout = pipe_with(process.output, self.terminal.clone(), Stream::Stdout, move |chunk| {
            if let Some(ready) = scanner.feed(chunk) {
                if output_latch.fire(ready) {
                    info!("server readiness detected from output");
                }
            }
        });
        let stderr = pipe_to_terminal(process.stderr, self.terminal.clone(), Stream::Stderr);

        let event_latch = latch.clone();
        let events = tokio::spawn(async move {
            loop {
                match port_events.recv().await {
                    Ok(ready) => {
                        if event_latch.fire(ready) {
                            info!("server readiness announced by sandbox");
                        }
                        break;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let step = SetupStep::AwaitReadiness;
        let timeout = self.setup.ready_timeout();
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            ready = latch.wait() => Ok(ready),
            code = &mut process.exit => Err(code.unwrap_or(UNKNOWN_EXIT)),
            _ = deadline => {
                if let Some(kill) = process.kill.take() {
                    let _ = kill.send(());
                }
                events.abort();
                stdout.abort();
                stderr.abort();
                let waited = timeout.unwrap_or(Duration::ZERO).as_secs();
                return Err(self.failure(step, format!("server not ready after {}s", waited)));
            }
        };

        let ready = match outcome {
            Ok(ready) => ready,
            Err(code) => {
                // The ready line may still be sitting in a pipe.
                events.abort();
                self.join_pipes([stdout, stderr]).await;
                return match latch.get() {
                    Some(_) => Err(self.failure(step, format!("server exited with code {} right after starting", code))),
                    None => Err(self.failure(step, format!("server exited with code {} before becoming ready", code))),
                };
            }
        };

        Ok(RunningServer {
            ready,
            exit: process.exit,
            input: process.input.take(),
            tasks: vec![stdout, stderr, events],
        })
    }
}
