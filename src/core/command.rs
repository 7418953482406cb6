//! Subprocess execution with argument validation and line streaming.
//!
//! Shells are never invoked: the command name and every argument must
//! pass a metacharacter deny-list before a process is spawned. Spawned
//! children are registered with the cleanup registry so signal handlers
//! can terminate them.

use super::cleanup::CleanupRegistry;
use super::error::{CoreError, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shell metacharacters that are rejected outright.
const DENIED_CHARS: &[char] = &[';', '&', '|', '`', '$'];

/// Redirection and substitution sequences that are rejected.
const DENIED_SEQUENCES: &[&str] = &["$(", "${", "&&", "||", ">>", "<<", ">", "<"];

/// Result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Which stream a line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// Options for a single execution.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Working directory for the child.
    pub cwd: PathBuf,
    /// Environment overrides merged over the parent environment.
    pub env: HashMap<String, String>,
    /// Content piped to the child's stdin, if any.
    pub stdin: Option<String>,
    /// Bounded wait; the child is killed when exceeded.
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    /// Creates options for the given working directory.
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            env: HashMap::new(),
            stdin: None,
            timeout: None,
        }
    }

    /// Sets an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the stdin payload.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Validates a command name or argument against the deny-list.
///
/// Allowed characters are `[A-Za-z0-9._/-]`, plus `\` on Windows so
/// native paths pass. Anything else is rejected.
pub fn validate_arg(arg: &str) -> Result<()> {
    if arg.is_empty() {
        return Err(CoreError::validation("empty argument"));
    }
    for seq in DENIED_SEQUENCES {
        if arg.contains(seq) {
            return Err(
                CoreError::validation(format!("argument contains denied sequence {seq:?}"))
                    .with_context("argument", arg),
            );
        }
    }
    if let Some(c) = arg.chars().find(|c| DENIED_CHARS.contains(c)) {
        return Err(
            CoreError::validation(format!("argument contains shell metacharacter {c:?}"))
                .with_context("argument", arg),
        );
    }
    let allowed = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '_'
            || c == '/'
            || c == '-'
            || (cfg!(windows) && c == '\\')
    };
    if let Some(c) = arg.chars().find(|&c| !allowed(c)) {
        return Err(
            CoreError::validation(format!("argument contains disallowed character {c:?}"))
                .with_context("argument", arg),
        );
    }
    Ok(())
}

/// Checks whether `name` resolves to an executable on `PATH`.
#[must_use]
pub fn command_exists(name: &str) -> bool {
    if validate_arg(name).is_err() {
        return false;
    }
    which::which(name).is_ok()
}

/// Runs subprocesses with validation, tracking, and stream handling.
pub struct CommandRunner {
    registry: Arc<CleanupRegistry>,
}

impl CommandRunner {
    /// Creates a runner backed by the given cleanup registry.
    #[must_use]
    pub fn new(registry: Arc<CleanupRegistry>) -> Self {
        Self { registry }
    }

    /// Runs a command to completion, capturing stdout and stderr.
    ///
    /// # Errors
    /// Returns a validation error before spawning if the command or any
    /// argument contains shell metacharacters, a timeout error if the
    /// bounded wait is exceeded, and a process error if spawning fails.
    pub fn exec(&self, cmd: &str, args: &[String], opts: &ExecOptions) -> Result<ExecOutput> {
        let mut child = self.spawn(cmd, args, opts)?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            CoreError::process("missing stdout pipe").with_context("command", cmd)
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CoreError::process("missing stderr pipe").with_context("command", cmd)
        })?;

        let stdout_handle = std::thread::spawn(move || read_to_string_lossy(stdout));
        let stderr_handle = std::thread::spawn(move || read_to_string_lossy(stderr));

        let status = self.wait_with_timeout(&mut child, opts.timeout, cmd)?;

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        self.registry.unregister_child(pid);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: status,
        })
    }

    /// Runs a command, delivering non-empty output lines in arrival order.
    ///
    /// Both stdout and stderr are read concurrently; lines are split on
    /// `\n` and handed to `on_line` tagged with their source stream.
    ///
    /// # Errors
    /// Same contract as [`CommandRunner::exec`].
    pub fn exec_streaming<F>(
        &self,
        cmd: &str,
        args: &[String],
        opts: &ExecOptions,
        mut on_line: F,
    ) -> Result<i32>
    where
        F: FnMut(StreamSource, &str),
    {
        let mut child = self.spawn(cmd, args, opts)?;
        let pid = child.id();

        let stdout = child.stdout.take().ok_or_else(|| {
            CoreError::process("missing stdout pipe").with_context("command", cmd)
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CoreError::process("missing stderr pipe").with_context("command", cmd)
        })?;

        let (tx, rx) = mpsc::channel::<(StreamSource, String)>();
        let tx_err = tx.clone();

        let stdout_handle = std::thread::spawn(move || {
            forward_lines(stdout, StreamSource::Stdout, &tx);
        });
        let stderr_handle = std::thread::spawn(move || {
            forward_lines(stderr, StreamSource::Stderr, &tx_err);
        });

        let deadline = opts.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;

        // Drain lines while the child runs; the channel closes once both
        // reader threads finish.
        loop {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok((source, line)) => on_line(source, &line),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Some(deadline) = deadline {
                        if Instant::now() > deadline {
                            timed_out = true;
                            let _ = child.kill();
                            break;
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let _ = stdout_handle.join();
        let _ = stderr_handle.join();

        // Deliver anything still buffered after the readers closed.
        while let Ok((source, line)) = rx.try_recv() {
            on_line(source, &line);
        }

        let status = child.wait().map_err(CoreError::from)?;
        self.registry.unregister_child(pid);

        if timed_out {
            return Err(CoreError::timeout(format!(
                "command {cmd} exceeded timeout"
            ))
            .with_context("command", cmd));
        }

        Ok(status.code().unwrap_or(-1))
    }

    fn spawn(
        &self,
        cmd: &str,
        args: &[String],
        opts: &ExecOptions,
    ) -> Result<std::process::Child> {
        validate_arg(cmd)?;
        for arg in args {
            validate_arg(arg)?;
        }

        let mut command = Command::new(cmd);
        command
            .args(args)
            .current_dir(&opts.cwd)
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &opts.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|e| {
            CoreError::process(format!("failed to spawn {cmd}: {e}")).with_context("command", cmd)
        })?;
        self.registry.register_child(child.id(), cmd.to_string());

        if let Some(ref payload) = opts.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(payload.as_bytes()).map_err(|e| {
                    CoreError::process(format!("failed to write stdin: {e}"))
                        .with_context("command", cmd)
                })?;
            }
        }

        Ok(child)
    }

    fn wait_with_timeout(
        &self,
        child: &mut std::process::Child,
        timeout: Option<Duration>,
        cmd: &str,
    ) -> Result<i32> {
        let start = Instant::now();
        loop {
            if let Some(status) = child.try_wait().map_err(CoreError::from)? {
                return Ok(status.code().unwrap_or(-1));
            }
            if let Some(timeout) = timeout {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    self.registry.unregister_child(child.id());
                    return Err(CoreError::timeout(format!(
                        "command {cmd} exceeded {timeout:?}"
                    ))
                    .with_context("command", cmd));
                }
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

fn read_to_string_lossy(mut stream: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

fn forward_lines(
    stream: impl Read,
    source: StreamSource,
    tx: &mpsc::Sender<(StreamSource, String)>,
) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if line.is_empty() {
            continue;
        }
        if tx.send((source, line)).is_err() {
            break;
        }
    }
}

/// Convenience: validates a full argv without running anything.
pub fn validate_argv(cmd: &str, args: &[String]) -> Result<()> {
    validate_arg(cmd)?;
    for arg in args {
        validate_arg(arg)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> CommandRunner {
        CommandRunner::new(Arc::new(CleanupRegistry::new()))
    }

    #[test]
    fn rejects_shell_metacharacters() {
        for bad in [";", "&", "|", "`", "$", "a;b", "x&&y", "p||q", "$(id)", "${HOME}"] {
            assert!(validate_arg(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn rejects_redirection() {
        for bad in ["a>b", "a<b", "a>>b", "a<<b"] {
            assert!(validate_arg(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn accepts_plain_arguments() {
        for ok in ["echo", "ls", "-la", "--flag", "src/main.rs", "a.b_c-d", "/usr/bin/env"] {
            assert!(validate_arg(ok).is_ok(), "{ok:?} should be accepted");
        }
    }

    #[test]
    fn rejects_spaces_and_quotes() {
        assert!(validate_arg("a b").is_err());
        assert!(validate_arg("\"quoted\"").is_err());
    }

    #[test]
    fn command_exists_for_real_binaries() {
        assert!(command_exists("sh"));
        assert!(!command_exists("definitely-not-a-binary-2q9x"));
        assert!(!command_exists("bad;name"));
    }

    #[test]
    fn exec_captures_output() {
        let out = runner()
            .exec(
                "echo",
                &["hello".to_string()],
                &ExecOptions::new(std::env::temp_dir()),
            )
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("hello"));
    }

    #[test]
    fn exec_pipes_stdin() {
        let out = runner()
            .exec(
                "cat",
                &[],
                &ExecOptions::new(std::env::temp_dir()).with_stdin("piped-content"),
            )
            .unwrap();
        assert!(out.stdout.contains("piped-content"));
    }

    #[test]
    fn exec_times_out() {
        let err = runner()
            .exec(
                "sleep",
                &["5".to_string()],
                &ExecOptions::new(std::env::temp_dir())
                    .with_timeout(Duration::from_millis(50)),
            )
            .unwrap_err();
        assert_eq!(err.code, crate::core::error::ErrorCode::Timeout);
    }

    #[test]
    fn exec_rejects_invalid_argv_before_spawn() {
        let err = runner()
            .exec(
                "echo",
                &["ok".to_string(), "bad;arg".to_string()],
                &ExecOptions::new(std::env::temp_dir()),
            )
            .unwrap_err();
        assert_eq!(err.code, crate::core::error::ErrorCode::Validation);
    }

    #[test]
    fn streaming_delivers_nonempty_lines_in_order() {
        let mut lines = Vec::new();
        let code = runner()
            .exec_streaming(
                "cat",
                &[],
                &ExecOptions::new(std::env::temp_dir()).with_stdin("a\nb\n\nc\n"),
                |source, line| {
                    if source == StreamSource::Stdout {
                        lines.push(line.to_string());
                    }
                },
            )
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn env_overrides_reach_the_child() {
        let out = runner()
            .exec(
                "printenv",
                &["RALPHY_TEST_VAR".to_string()],
                &ExecOptions::new(std::env::temp_dir()).with_env("RALPHY_TEST_VAR", "42"),
            )
            .unwrap();
        assert!(out.stdout.contains("42"));
    }
}
