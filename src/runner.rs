//! # runner.rs
//!
//! Launches external tools and relays their output while they run.
//!
//! stdout and stderr of the child share one pipe, the same way `2>&1` would wire them,
//! so lines keep the order the child wrote them in. A single reader thread splits the
//! pipe into lines and feeds a bounded channel. The exit status is only collected once
//! the stream has closed.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, ExitStatus};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::template::ResolvedCommand;

/// Lines buffered between the pipe reader and the consumer.
const LINE_BUFFER: usize = 256;

/// The complete environment handed to every launched process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    /// Snapshot of the current process environment.
    pub fn inherit() -> Self {
        Environment {
            vars: std::env::vars_os().collect(),
        }
    }

    /// Returns a copy with `overrides` merged in; overrides win on collisions.
    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        for (key, value) in overrides {
            self.vars.insert(key.into(), value.into());
        }
        self
    }

    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// What a finished process left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub program: String,
    pub exit_code: i32,
    /// Every relayed line, newline-terminated, in relay order.
    pub output: String,
    pub line_count: usize,
}

/// Runs commands with a fixed environment; shell-mode commands go through `shell -c`.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    env: Environment,
    shell: String,
}

/// A launched child whose merged output has not been fully consumed yet.
pub struct RunningProcess {
    program: String,
    child: Child,
    lines: Receiver<String>,
    reader: JoinHandle<()>,
}

/// Copies every write to two sinks, e.g. the console and a log file.
pub struct Tee<A, B> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Tee<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Tee { first, second }
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

impl ProcessRunner {
    pub fn new(env: Environment, shell: impl Into<String>) -> Self {
        ProcessRunner {
            env,
            shell: shell.into(),
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    ///
    /// Starts `command` with stdout and stderr writing into the same pipe.
    ///
    /// # Errors
    /// Returns `EmptyCommand` for an empty command and `Spawn` if the OS cannot start it.
    pub fn spawn(&self, command: &ResolvedCommand) -> Result<RunningProcess, PipelineError> {
        let mut cmd = match command {
            ResolvedCommand::Argv(args) => {
                let (program, rest) = args.split_first().ok_or(PipelineError::EmptyCommand)?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
            ResolvedCommand::Shell(line) => {
                if line.trim().is_empty() {
                    return Err(PipelineError::EmptyCommand);
                }
                let mut cmd = Command::new(&self.shell);
                cmd.arg("-c").arg(line);
                cmd
            }
        };
        let (pipe, writer) = io::pipe()?;
        cmd.env_clear()
            .envs(&self.env.vars)
            .stdout(writer.try_clone()?)
            .stderr(writer);

        let program = command.program().to_string();
        debug!("launching {}", command);
        let spawned = cmd.spawn();
        // the write ends held by `cmd` must be closed, or the stream never ends
        drop(cmd);
        let child = spawned.map_err(|source| PipelineError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (sender, lines) = sync_channel(LINE_BUFFER);
        Ok(RunningProcess {
            program,
            child,
            lines,
            reader: spawn_line_reader(pipe, sender),
        })
    }

    ///
    /// Runs `command` to completion, writing each output line to `sink` as it arrives.
    ///
    /// # Errors
    /// Returns `ProcessFailed` with the exit code if the process exits non-zero, after
    /// every line it produced has been relayed. If `sink` stops accepting output the
    /// process is killed and reaped before the write error is returned.
    pub fn run<W: Write>(
        &self,
        command: &ResolvedCommand,
        sink: &mut W,
    ) -> Result<ProcessOutcome, PipelineError> {
        let mut process = self.spawn(command)?;
        let mut output = String::new();
        let mut line_count = 0;
        let mut sink_error = None;
        for line in process.lines() {
            if let Err(e) = writeln!(sink, "{}", line).and_then(|_| sink.flush()) {
                sink_error = Some(e);
                break;
            }
            output.push_str(&line);
            output.push('\n');
            line_count += 1;
        }
        if let Some(e) = sink_error {
            let code = process.kill()?;
            warn!(
                "output sink failed after {} lines, {} stopped with code {}",
                line_count,
                command.program(),
                code
            );
            return Err(e.into());
        }
        let program = process.program.clone();
        let exit_code = process.wait()?;
        debug!("{} exited with code {} after {} lines", program, exit_code, line_count);

        if exit_code != 0 {
            return Err(PipelineError::ProcessFailed {
                program,
                code: exit_code,
            });
        }
        Ok(ProcessOutcome {
            program,
            exit_code,
            output,
            line_count,
        })
    }
}

impl RunningProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Merged output lines, blocking for each one; ends when every writer has closed the pipe.
    pub fn lines(&mut self) -> impl Iterator<Item = String> + '_ {
        self.lines.iter()
    }

    /// Discards unread output, then waits for the process and returns its exit code.
    pub fn wait(self) -> Result<i32, PipelineError> {
        let RunningProcess {
            program,
            mut child,
            lines,
            reader,
        } = self;
        let unread = lines.iter().count();
        if unread > 0 {
            debug!("discarded {} unread lines from {}", unread, program);
        }
        if reader.join().is_err() {
            warn!("output reader for {} panicked", program);
        }
        let status = child.wait()?;
        Ok(exit_code(status))
    }

    ///
    /// Stops the process without reading the rest of its output and reaps it.
    ///
    /// The reader thread is left to finish on its own: a grandchild can keep the pipe
    /// open after the direct child is gone.
    pub fn kill(self) -> Result<i32, PipelineError> {
        let RunningProcess {
            program,
            mut child,
            lines,
            reader,
        } = self;
        drop(lines);
        if let Err(e) = child.kill() {
            debug!("could not kill {}: {}", program, e);
        }
        let status = child.wait()?;
        drop(reader);
        Ok(exit_code(status))
    }
}

fn spawn_line_reader<R>(pipe: R, sender: SyncSender<String>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    if buf.ends_with(b"\n") {
                        buf.pop();
                        if buf.ends_with(b"\r") {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if sender.send(line).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Exit code, or `128 + signal` for a process killed by a signal on Unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> ProcessRunner {
        ProcessRunner::new(Environment::inherit(), "sh")
    }

    fn sh(script: &str) -> ResolvedCommand {
        ResolvedCommand::Argv(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_relays_lines_in_order() {
        let mut sink = Vec::new();
        let outcome = runner()
            .run(&sh("printf 'one\\ntwo\\nthree\\n'"), &mut sink)
            .unwrap();
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.line_count, 3);
        assert_eq!(outcome.output, "one\ntwo\nthree\n");
        assert_eq!(String::from_utf8(sink).unwrap(), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_merges_stderr_in_write_order() {
        let mut sink = Vec::new();
        let outcome = runner()
            .run(&sh("echo a; echo b >&2; echo c; echo d >&2"), &mut sink)
            .unwrap();
        assert_eq!(outcome.line_count, 4);
        assert_eq!(String::from_utf8(sink).unwrap(), "a\nb\nc\nd\n");
    }

    #[test]
    fn test_alternating_streams_keep_order() {
        let script = "i=0; while [ $i -lt 20 ]; do echo out$i; echo err$i >&2; i=$((i+1)); done";
        let expected: String = (0..20).map(|i| format!("out{i}\nerr{i}\n")).collect();
        for _ in 0..5 {
            let outcome = runner().run(&sh(script), &mut Vec::new()).unwrap();
            assert_eq!(outcome.output, expected);
        }
    }

    /// Accepts one line, then fails like a closed stdout.
    struct ClosesAfterFirstLine {
        lines: usize,
    }

    impl Write for ClosesAfterFirstLine {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.lines >= 1 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"));
            }
            self.lines += buf.iter().filter(|b| **b == b'\n').count();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failing_sink_stops_the_process() {
        let work = tempfile::tempdir().unwrap();
        let marker = work.path().join("still-running");
        let script = format!("echo one; echo two; sleep 1; touch {}", marker.display());
        let mut sink = ClosesAfterFirstLine { lines: 0 };
        let result = runner().run(&sh(&script), &mut sink);
        match result {
            Err(PipelineError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected the sink error, got {:?}", other),
        }
        std::thread::sleep(std::time::Duration::from_millis(1500));
        assert!(!marker.exists());
    }

    #[test]
    fn test_tee_writes_both_sinks() {
        let mut console = Vec::new();
        let mut log = Vec::new();
        runner()
            .run(&sh("echo one; echo two >&2"), &mut Tee::new(&mut console, &mut log))
            .unwrap();
        assert_eq!(console, b"one\ntwo\n");
        assert_eq!(log, console);
    }

    #[test]
    fn test_failure_carries_exit_code_after_relaying() {
        let mut sink = Vec::new();
        let result = runner().run(&sh("echo first; echo second; exit 2"), &mut sink);
        match result {
            Err(PipelineError::ProcessFailed { program, code }) => {
                assert_eq!(program, "sh");
                assert_eq!(code, 2);
            }
            other => panic!("expected ProcessFailed, got {:?}", other),
        }
        assert_eq!(String::from_utf8(sink).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_last_line_without_newline() {
        let mut sink = Vec::new();
        let outcome = runner().run(&sh("printf 'partial'"), &mut sink).unwrap();
        assert_eq!(outcome.line_count, 1);
        assert_eq!(outcome.output, "partial\n");
    }

    #[test]
    fn test_long_output_does_not_block() {
        let mut sink = Vec::new();
        let outcome = runner().run(&sh("seq 1 5000"), &mut sink).unwrap();
        assert_eq!(outcome.line_count, 5000);
        assert!(outcome.output.ends_with("4999\n5000\n"));
    }

    #[test]
    fn test_environment_overrides_win() {
        let env = Environment::inherit().with_overrides([
            ("HOME", "/override/home"),
            ("AFNI_BIDS_RUNNER_TEST", "merged"),
        ]);
        assert_eq!(env.get("HOME"), Some(OsStr::new("/override/home")));
        let runner = ProcessRunner::new(env, "sh");
        let mut sink = Vec::new();
        let outcome = runner
            .run(&sh("echo \"$HOME $AFNI_BIDS_RUNNER_TEST\""), &mut sink)
            .unwrap();
        assert_eq!(outcome.output, "/override/home merged\n");
    }

    #[test]
    fn test_environment_is_explicit() {
        let runner = ProcessRunner::new(Environment::default(), "/bin/sh");
        let mut sink = Vec::new();
        let outcome = runner
            .run(
                &ResolvedCommand::Shell("echo \"[${AFNI_BIDS_UNSET_VAR:-none}]\"".to_string()),
                &mut sink,
            )
            .unwrap();
        assert_eq!(outcome.output, "[none]\n");
    }

    #[test]
    fn test_shell_mode_pipeline() {
        let mut sink = Vec::new();
        let outcome = runner()
            .run(
                &ResolvedCommand::Shell("echo hello | tr a-z A-Z".to_string()),
                &mut sink,
            )
            .unwrap();
        assert_eq!(outcome.output, "HELLO\n");
    }

    #[test]
    fn test_signal_exit_code() {
        let mut sink = Vec::new();
        let result = runner().run(&sh("kill -TERM $$"), &mut sink);
        assert!(matches!(
            result,
            Err(PipelineError::ProcessFailed { code: 143, .. })
        ));
    }

    #[test]
    fn test_missing_program() {
        let command = ResolvedCommand::Argv(vec!["afni-bids-no-such-tool".to_string()]);
        let mut sink = Vec::new();
        assert!(matches!(
            runner().run(&command, &mut sink),
            Err(PipelineError::Spawn { .. })
        ));
        assert!(matches!(
            runner().run(&ResolvedCommand::Argv(Vec::new()), &mut sink),
            Err(PipelineError::EmptyCommand)
        ));
    }

    #[test]
    fn test_wait_without_reading() {
        let process = runner().spawn(&sh("seq 1 2000; exit 3")).unwrap();
        assert_eq!(process.program(), "sh");
        assert_eq!(process.wait().unwrap(), 3);
    }
}
