use std::future::Future;
use std::io::Write as _;
use std::pin::Pin;

use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::tm::log::{tm_debug, tm_event};

pub const PROMPT: &str = "taskmaster$ ";

const ETX: u8 = 0x03; // Ctrl+C
const EOT: u8 = 0x04; // Ctrl+D
const BS: u8 = 0x08;
const HT: u8 = 0x09;
const NL: u8 = 0x0a;
const CR: u8 = 0x0d;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

const NAME_WIDTH: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum TermError {
    /// Sentinel returned by the exit command; ends the editor loop.
    #[error("exit")]
    Exit,

    #[error("{0}")]
    Command(String),
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), TermError>> + Send>>;
pub type Handler = Box<dyn Fn(Vec<String>) -> HandlerFuture + Send + Sync>;

struct Cmd {
    name: String,
    description: String,
    // Built-ins (help, exit) are dispatched by name and carry no handler.
    handler: Option<Handler>,
}

/// A small raw-mode line discipline: byte-at-a-time input with history,
/// tab completion, and a registry of named commands.
pub struct Term {
    cmds: Vec<Cmd>,
    completions: Vec<String>,
    history: Vec<String>,
    history_idx: Option<usize>,
    input: String,
    cursor: usize,
    done: CancellationToken,
}

impl Term {
    pub fn new() -> Term {
        let mut t = Term {
            cmds: Vec::new(),
            completions: Vec::new(),
            history: Vec::new(),
            history_idx: None,
            input: String::new(),
            cursor: 0,
            done: CancellationToken::new(),
        };
        t.cmds.push(Cmd {
            name: "exit".into(),
            description: "End the program.".into(),
            handler: None,
        });
        t.cmds.push(Cmd {
            name: "help".into(),
            description: "List commands or get information about a specific one.".into(),
            handler: None,
        });
        t
    }

    pub fn add_cmd(&mut self, name: &str, description: &str, handler: Handler) {
        self.cmds.push(Cmd {
            name: name.to_string(),
            description: description.to_string(),
            handler: Some(handler),
        });
    }

    /// Extra completion candidates beyond command names; the daemon
    /// installs task names here.
    pub fn set_completions(&mut self, items: Vec<String>) {
        self.completions = items;
    }

    /// The done channel: cancelled by stop() or end-of-input.
    pub fn stop_token(&self) -> CancellationToken {
        self.done.clone()
    }

    pub fn stop(&self) {
        self.done.cancel();
    }

    pub async fn run(&mut self) -> std::io::Result<()> {
        println!("Welcome to taskmaster! Type 'exit' to quit.");
        tm_event("term", None, "running");

        let _raw = RawMode::enable()?;
        let mut rx = spawn_stdin_reader();

        loop {
            self.print_prompt();
            let done = self.done.clone();
            let submitted = tokio::select! {
                _ = done.cancelled() => None,
                line = self.read_line(&mut rx) => line,
            };

            let Some(input) = submitted else { break };
            if input.is_empty() {
                continue;
            }
            self.add_history(&input);
            match self.execute(&input).await {
                Ok(()) => {}
                Err(TermError::Exit) => break,
                Err(e) => tm_event("term", None, format!("command failed: {e}")),
            }
        }

        self.done.cancel();
        println!();
        tm_event("term", None, "exit");
        Ok(())
    }

    async fn read_line(&mut self, rx: &mut mpsc::Receiver<u8>) -> Option<String> {
        self.input.clear();
        self.cursor = 0;

        loop {
            let b = rx.recv().await?;
            match b {
                ETX => {
                    println!();
                    self.input.clear();
                    self.cursor = 0;
                    self.print_prompt();
                    continue;
                }
                EOT => return None,
                HT => self.complete(),
                NL | CR => {
                    println!();
                    return Some(self.input.trim().to_string());
                }
                ESC => {
                    let b1 = rx.recv().await?;
                    let b2 = rx.recv().await?;
                    if b1 == b'[' {
                        match b2 {
                            b'A' => self.history_up(),
                            b'B' => self.history_down(),
                            _ => {}
                        }
                    }
                }
                BS | DEL => self.backspace(),
                0x20..=0x7e => self.insert(b as char),
                _ => {}
            }
            self.refresh_line();
        }
    }

    async fn execute(&mut self, line: &str) -> Result<(), TermError> {
        let args: Vec<String> = line.split_whitespace().map(String::from).collect();
        if args.is_empty() {
            return Ok(());
        }
        tm_debug("term", None, format!("cmd: {line}"));

        match args[0].as_str() {
            "exit" => {
                println!("Bye bye!");
                Err(TermError::Exit)
            }
            "help" => self.run_help(&args),
            name => match self.cmds.iter().find(|c| c.name == name) {
                None => {
                    println!("Error: unknown command: {name}");
                    Err(TermError::Command(format!("unknown command: {name}")))
                }
                Some(cmd) => match &cmd.handler {
                    Some(h) => h(args).await,
                    None => Ok(()),
                },
            },
        }
    }

    fn run_help(&self, args: &[String]) -> Result<(), TermError> {
        match args.len() {
            1 => {
                for cmd in &self.cmds {
                    println!("{:<NAME_WIDTH$} {}", cmd.name, cmd.description);
                }
                Ok(())
            }
            2 => match self.cmds.iter().find(|c| c.name == args[1]) {
                Some(cmd) => {
                    println!("{:<NAME_WIDTH$} {}", cmd.name, cmd.description);
                    Ok(())
                }
                None => Err(TermError::Command(format!("help: command {} not found", args[1]))),
            },
            _ => Err(TermError::Command("help: too many arguments".into())),
        }
    }

    fn insert(&mut self, c: char) {
        self.input.insert(self.cursor, c);
        self.cursor += 1;
    }

    fn backspace(&mut self) {
        if self.cursor > 0 {
            self.input.remove(self.cursor - 1);
            self.cursor -= 1;
        }
    }

    fn history_up(&mut self) {
        if self.history.is_empty() {
            return;
        }
        self.history_idx = Some(match self.history_idx {
            None => self.history.len() - 1,
            Some(0) => 0,
            Some(i) => i - 1,
        });
        self.input = self.history[self.history_idx.unwrap()].clone();
        self.cursor = self.input.len();
    }

    fn history_down(&mut self) {
        let Some(idx) = self.history_idx else { return };
        if idx + 1 < self.history.len() {
            self.history_idx = Some(idx + 1);
            self.input = self.history[idx + 1].clone();
        } else {
            // Past the newest entry the line collapses to empty.
            self.history_idx = None;
            self.input.clear();
        }
        self.cursor = self.input.len();
    }

    fn add_history(&mut self, line: &str) {
        if !line.is_empty() && self.history.last().map(String::as_str) != Some(line) {
            self.history.push(line.to_string());
        }
        self.history_idx = None;
    }

    fn complete(&mut self) {
        if self.input.is_empty() {
            return;
        }
        let mut words: Vec<String> = self.input.split_whitespace().map(String::from).collect();
        let Some(last) = words.last().cloned() else { return };

        let matches: Vec<&str> = self
            .cmds
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.completions.iter().map(String::as_str))
            .filter(|cand| cand.starts_with(last.as_str()))
            .collect();

        match matches.len() {
            0 => {}
            1 => {
                *words.last_mut().expect("nonempty") = matches[0].to_string();
                self.input = words.join(" ");
                self.cursor = self.input.len();
            }
            _ => {
                println!();
                println!("{}", matches.join(" "));
                self.print_prompt();
            }
        }
    }

    fn print_prompt(&self) {
        print!("{PROMPT}{}", self.input);
        let _ = std::io::stdout().flush();
    }

    fn refresh_line(&self) {
        print!("\r\x1b[2K");
        self.print_prompt();
    }
}

impl Default for Term {
    fn default() -> Self {
        Term::new()
    }
}

/// Feeds stdin bytes to the editor from the blocking pool, so the async
/// loop never blocks on a read.
fn spawn_stdin_reader() -> mpsc::Receiver<u8> {
    let (tx, rx) = mpsc::channel::<u8>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => {
                    let _ = tx.blocking_send(EOT);
                    return;
                }
                Ok(_) => {
                    if tx.blocking_send(buf[0]).is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

/// Puts the controlling terminal into non-canonical no-echo mode and
/// restores the saved state on drop.
struct RawMode {
    original: Termios,
}

impl RawMode {
    fn enable() -> std::io::Result<RawMode> {
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin).map_err(std::io::Error::from)?;
        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).map_err(std::io::Error::from)?;
        Ok(RawMode { original })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &self.original);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn editor_with(commands: &[&str]) -> Term {
        let mut t = Term::new();
        for name in commands {
            t.add_cmd(name, "", Box::new(|_| Box::pin(async { Ok(()) })));
        }
        t
    }

    #[test]
    fn unique_prefix_completes_in_place() {
        let mut t = editor_with(&["status", "start", "reload"]);
        t.input = "rel".into();
        t.cursor = 3;
        t.complete();
        assert_eq!(t.input, "reload");
        assert_eq!(t.cursor, 6);
    }

    #[test]
    fn completion_targets_the_last_token() {
        let mut t = editor_with(&["status", "start"]);
        t.set_completions(vec!["web".into(), "worker".into()]);
        t.input = "status web".into();
        t.cursor = t.input.len();
        t.complete();
        // "web" prefixes both web and worker? No: worker does not start
        // with web, so the unique match substitutes.
        assert_eq!(t.input, "status web");

        t.input = "status wo".into();
        t.cursor = t.input.len();
        t.complete();
        assert_eq!(t.input, "status worker");
    }

    #[test]
    fn ambiguous_prefix_leaves_input_unchanged() {
        let mut t = editor_with(&["status", "start", "stop"]);
        t.input = "st".into();
        t.cursor = 2;
        t.complete();
        assert_eq!(t.input, "st");
    }

    #[test]
    fn history_walks_back_and_collapses_forward() {
        let mut t = editor_with(&[]);
        t.add_history("first");
        t.add_history("second");

        t.history_up();
        assert_eq!(t.input, "second");
        t.history_up();
        assert_eq!(t.input, "first");
        t.history_up();
        assert_eq!(t.input, "first"); // clamped at the oldest

        t.history_down();
        assert_eq!(t.input, "second");
        t.history_down();
        assert_eq!(t.input, ""); // newest collapses to empty
        assert!(t.history_idx.is_none());
    }

    #[test]
    fn history_skips_consecutive_duplicates() {
        let mut t = editor_with(&[]);
        t.add_history("status");
        t.add_history("status");
        assert_eq!(t.history.len(), 1);
    }

    #[test]
    fn editing_inserts_and_removes_at_cursor() {
        let mut t = editor_with(&[]);
        for c in "stp".chars() {
            t.insert(c);
        }
        t.cursor = 2;
        t.insert('o');
        assert_eq!(t.input, "stop");
        t.backspace();
        assert_eq!(t.input, "stp");
        assert_eq!(t.cursor, 2);
    }

    #[test]
    fn help_rejects_extra_arguments() {
        let t = editor_with(&["status"]);
        let args: Vec<String> = vec!["help".into(), "a".into(), "b".into()];
        assert!(t.run_help(&args).is_err());
        let args: Vec<String> = vec!["help".into(), "status".into()];
        assert!(t.run_help(&args).is_ok());
        let args: Vec<String> = vec!["help".into(), "missing".into()];
        assert!(t.run_help(&args).is_err());
    }
}
