// src/shell.rs
// Interactive shell inside the sandbox, wired to the terminal.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::SandboxError;
use crate::sandbox::{Sandbox, UNKNOWN_EXIT};
use crate::terminal::{pipe_to_terminal, Stream, Terminal};
use crate::types::{SpawnOptions, TerminalSize};

pub struct ShellBridge {
    input: Option<mpsc::UnboundedSender<String>>,
    resize: Option<mpsc::UnboundedSender<TerminalSize>>,
    exit: oneshot::Receiver<i32>,
    tasks: Vec<JoinHandle<()>>,
}

impl ShellBridge {
    /// Starts `shell` and forwards terminal keystrokes to it.
    pub async fn spawn(
        sandbox: &dyn Sandbox,
        terminal: Arc<dyn Terminal>,
        shell: &str,
        cwd: Option<String>,
    ) -> Result<Self, SandboxError> {
        let process = sandbox.spawn(shell, &[], SpawnOptions { cwd }).await?;
        info!(shell, "interactive shell started");

        let mut tasks = vec![
            pipe_to_terminal(process.output, terminal.clone(), Stream::Stdout),
            pipe_to_terminal(process.stderr, terminal.clone(), Stream::Stderr),
        ];

        if let (Some(mut keys), Some(input)) = (terminal.take_input(), process.input.clone()) {
            tasks.push(tokio::spawn(async move {
                while let Some(data) = keys.recv().await {
                    if input.send(data).is_err() {
                        break;
                    }
                }
                debug!("terminal input closed");
            }));
        }

        let bridge = ShellBridge {
            input: process.input,
            resize: process.resize,
            exit: process.exit,
            tasks,
        };
        bridge.resize(terminal.size());
        Ok(bridge)
    }

    /// Sends raw input to the shell; false once it stopped reading.
    pub fn write(&self, data: &str) -> bool {
        self.input.as_ref().map_or(false, |input| input.send(data.to_string()).is_ok())
    }

    pub fn resize(&self, size: TerminalSize) -> bool {
        self.resize.as_ref().map_or(false, |resize| resize.send(size).is_ok())
    }

    pub async fn wait(&mut self) -> i32 {
        (&mut self.exit).await.unwrap_or(UNKNOWN_EXIT)
    }
}

impl Drop for ShellBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{MemorySandbox, ProcessScript};
    use crate::terminal::BufferTerminal;
    use std::time::Duration;

    #[tokio::test]
    async fn keystrokes_reach_the_shell_and_size_is_forwarded() {
        let sandbox = MemorySandbox::new();
        sandbox.script("jsh", ProcessScript::long_running().echoing_input());
        let terminal = Arc::new(BufferTerminal::new());
        terminal.set_size(TerminalSize { cols: 120, rows: 40 });

        let bridge = ShellBridge::spawn(&sandbox, terminal.clone(), "jsh", None).await.unwrap();
        terminal.type_input("ls docs\n");
        assert!(bridge.resize(TerminalSize { cols: 100, rows: 30 }));

        let mut echoed = false;
        for _ in 0..100 {
            if terminal.contents().contains("ls docs") {
                echoed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(echoed);
        assert_eq!(
            sandbox.resizes(),
            vec![TerminalSize { cols: 120, rows: 40 }, TerminalSize { cols: 100, rows: 30 }]
        );
    }

    #[tokio::test]
    async fn missing_shell_is_a_spawn_error() {
        let sandbox = MemorySandbox::new();
        let terminal = Arc::new(BufferTerminal::new());
        let result = ShellBridge::spawn(&sandbox, terminal, "jsh", None).await;
        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }
}
