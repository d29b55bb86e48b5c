// src/terminal.rs
// The terminal collaborator: receives process output, reports its size and
// hands keystrokes to whoever owns the shell.

use owo_colors::OwoColorize;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::TerminalSize;

pub trait Terminal: Send + Sync {
    fn write(&self, data: &str);

    /// Error output is shown in red.
    fn write_error(&self, data: &str) {
        self.write(&format!("{}", data.red()));
    }

    fn writeln(&self, line: &str) {
        self.write(&format!("{}\r\n", line));
    }

    fn writeln_error(&self, line: &str) {
        self.write_error(&format!("{}\r\n", line));
    }

    fn size(&self) -> TerminalSize {
        TerminalSize::default()
    }

    /// Keystroke stream; handed out once.
    fn take_input(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        None
    }
}

/// Which process stream a pipe carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Forwards every chunk of `rx` to `terminal` until the sender closes.
pub fn pipe_to_terminal(
    rx: mpsc::UnboundedReceiver<String>,
    terminal: Arc<dyn Terminal>,
    stream: Stream,
) -> JoinHandle<()> {
    pipe_with(rx, terminal, stream, |_| {})
}

/// Like `pipe_to_terminal`, also showing each chunk to `inspect` after it was written.
pub fn pipe_with<F>(
    mut rx: mpsc::UnboundedReceiver<String>,
    terminal: Arc<dyn Terminal>,
    stream: Stream,
    mut inspect: F,
) -> JoinHandle<()>
where
    F: FnMut(&str) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match stream {
                Stream::Stdout => terminal.write(&chunk),
                Stream::Stderr => terminal.write_error(&chunk),
            }
            inspect(&chunk);
        }
    })
}

/// Writes straight to the process stdout; input comes from stdin lines.
#[derive(Default)]
pub struct StdoutTerminal {
    forward_stdin: bool,
    taken: Mutex<bool>,
}

impl StdoutTerminal {
    pub fn new() -> Self {
        StdoutTerminal::default()
    }

    /// Also forward stdin to the shell. Needs a running tokio runtime when input is taken.
    pub fn with_stdin() -> Self {
        StdoutTerminal { forward_stdin: true, taken: Mutex::new(false) }
    }
}

fn env_dimension(key: &str) -> Option<u16> {
    std::env::var(key).ok()?.trim().parse().ok()
}

impl Terminal for StdoutTerminal {
    fn write(&self, data: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data.as_bytes());
        let _ = stdout.flush();
    }

    fn size(&self) -> TerminalSize {
        let default = TerminalSize::default();
        TerminalSize {
            cols: env_dimension("COLUMNS").unwrap_or(default.cols),
            rows: env_dimension("LINES").unwrap_or(default.rows),
        }
    }

    fn take_input(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        if !self.forward_stdin {
            return None;
        }
        let mut taken = self.taken.lock().unwrap_or_else(PoisonError::into_inner);
        if *taken {
            return None;
        }
        *taken = true;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(format!("{}\n", line)).is_err() {
                    break;
                }
            }
        });
        Some(rx)
    }
}

/// Collects everything written; used by tests and by the `tree` command.
pub struct BufferTerminal {
    buffer: Mutex<String>,
    size: Mutex<TerminalSize>,
    input_tx: mpsc::UnboundedSender<String>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl Default for BufferTerminal {
    fn default() -> Self {
        BufferTerminal::new()
    }
}

impl BufferTerminal {
    pub fn new() -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        BufferTerminal {
            buffer: Mutex::new(String::new()),
            size: Mutex::new(TerminalSize::default()),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
        }
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Simulates typing into the terminal.
    pub fn type_input(&self, data: &str) {
        let _ = self.input_tx.send(data.to_string());
    }

    pub fn set_size(&self, size: TerminalSize) {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner) = size;
    }
}

impl Terminal for BufferTerminal {
    fn write(&self, data: &str) {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).push_str(data);
    }

    fn size(&self) -> TerminalSize {
        *self.size.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_input(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.input_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_output_is_red() {
        let terminal = BufferTerminal::new();
        terminal.write("ok ");
        terminal.write_error("bad");
        let contents = terminal.contents();
        assert!(contents.starts_with("ok "));
        assert!(contents.contains("\x1b[31mbad"));
    }

    #[tokio::test]
    async fn pipe_forwards_until_sender_closes() {
        let terminal = Arc::new(BufferTerminal::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pipe = pipe_with(rx, terminal.clone(), Stream::Stdout, move |chunk| {
            sink.lock().unwrap().push(chunk.to_string());
        });
        tx.send("one ".to_string()).unwrap();
        tx.send("two".to_string()).unwrap();
        drop(tx);
        pipe.await.unwrap();
        assert_eq!(terminal.contents(), "one two");
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn buffer_input_is_taken_once() {
        let terminal = BufferTerminal::new();
        terminal.type_input("ls\n");
        let mut input = terminal.take_input().unwrap();
        assert_eq!(input.try_recv().unwrap(), "ls\n");
        assert!(terminal.take_input().is_none());
    }
}
