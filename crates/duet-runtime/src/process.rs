//! ProcessRunner: spawn the test command and stream its output.

use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to start {program}: {source}")]
    Start {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program}: {stream} was not captured")]
    MissingPipe { program: String, stream: &'static str },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("waiting for {program} failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Exit status and everything the process printed on stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub transcript: String,
}

/// What a background run reports to the render loop. `run` is the
/// generation the lines belong to; older generations are ignored.
#[derive(Debug)]
pub enum RunEvent {
    Line { run: u64, line: String },
    Finished { run: u64, result: Result<RunOutput, RunError> },
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// `program arg1 arg2` for titles and logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Start the process with piped stdout/stderr and no stdin.
    pub fn spawn(&self) -> Result<RunningProcess, SpawnError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|source| SpawnError::Start {
            program: self.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SpawnError::MissingPipe {
            program: self.program.clone(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SpawnError::MissingPipe {
            program: self.program.clone(),
            stream: "stderr",
        })?;
        info!(command = %self.display(), pid = child.id(), "test command started");
        Ok(RunningProcess {
            program: self.program.clone(),
            child,
            stdout,
            stderr,
        })
    }

    /// Spawn and drive to completion, handing each stdout line to `on_line`.
    pub async fn execute(&self, on_line: impl FnMut(&str)) -> Result<RunOutput, RunError> {
        self.spawn()?.wait_with_lines(on_line).await
    }

    /// Run in a background task that reports through `events`.
    pub fn launch(self, run: u64, events: mpsc::UnboundedSender<RunEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let lines = events.clone();
            let result = self
                .execute(|line| {
                    let _ = lines.send(RunEvent::Line {
                        run,
                        line: line.to_owned(),
                    });
                })
                .await;
            let _ = events.send(RunEvent::Finished { run, result });
        })
    }
}

pub struct RunningProcess {
    program: String,
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

impl RunningProcess {
    /// Pump stdout into `on_line` and the transcript, log stderr, then wait
    /// for exit.
    pub async fn wait_with_lines(mut self, mut on_line: impl FnMut(&str)) -> Result<RunOutput, RunError> {
        let program = self.program.clone();
        let wait_err = |source| RunError::Wait {
            program: program.clone(),
            source,
        };

        let mut transcript = String::new();
        let stdout = pump_lines(BufReader::new(self.stdout), |line| {
            on_line(line);
            transcript.push_str(line);
            transcript.push('\n');
        });
        let stderr = pump_lines(BufReader::new(self.stderr), |line| {
            debug!(stream = "stderr", "{line}");
        });
        let (out, err) = tokio::join!(stdout, stderr);
        let status = reap(&mut self.child, out.and(err)).await.map_err(wait_err)?;
        info!(program = %self.program, code = ?status.code(), "test command exited");
        Ok(RunOutput {
            exit_code: status.code(),
            transcript,
        })
    }
}

/// Wait for `child` once its pipes are drained. A failed read kills it
/// first, and the read error is returned after the process is gone.
async fn reap(child: &mut Child, pumped: std::io::Result<()>) -> std::io::Result<ExitStatus> {
    if let Err(err) = pumped {
        warn!(%err, "reading test output failed, stopping the command");
        let _ = child.start_kill();
        child.wait().await?;
        return Err(err);
    }
    child.wait().await
}

/// Read lines until EOF. Invalid UTF-8 is replaced, line endings stripped.
async fn pump_lines<R: AsyncBufRead + Unpin>(mut reader: R, mut on_line: impl FnMut(&str)) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&buf);
        on_line(text.trim_end_matches(['\n', '\r']));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessRunner {
        ProcessRunner::new("sh", ["-c", script])
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn streams_lines_and_keeps_transcript() {
        let mut seen = Vec::new();
        let out = block_on(sh("echo one; echo two 1>&2; printf 'three\\r\\nfour'").execute(|l| seen.push(l.to_owned())))
            .unwrap();
        assert_eq!(seen, vec!["one", "three", "four"]);
        assert_eq!(out.transcript, "one\nthree\nfour\n");
        assert_eq!(out.exit_code, Some(0));
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut seen = Vec::new();
        block_on(sh("printf 'ok \\377\\n'").execute(|l| seen.push(l.to_owned()))).unwrap();
        assert_eq!(seen, vec!["ok \u{FFFD}"]);
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let out = block_on(sh("echo TEST_ITEM_ID: a; exit 3").execute(|_| {})).unwrap();
        assert_eq!(out.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn signal_exit_has_no_code() {
        let out = block_on(sh("kill -9 $$").execute(|_| {})).unwrap();
        assert_eq!(out.exit_code, None);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = block_on(ProcessRunner::new("duet-definitely-not-a-program", Vec::<String>::new()).execute(|_| {}))
            .unwrap_err();
        assert!(matches!(err, RunError::Spawn(SpawnError::Start { .. })));
        assert!(err.to_string().contains("duet-definitely-not-a-program"));
    }

    #[test]
    fn env_reaches_the_child() {
        let out = block_on(sh("echo $DUET_HOST:$DUET_PORT").env("DUET_HOST", "127.0.0.1").env("DUET_PORT", "4242").execute(|_| {}))
            .unwrap();
        assert_eq!(out.transcript, "127.0.0.1:4242\n");
    }

    #[tokio::test]
    async fn launch_reports_lines_then_finish() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        sh("echo a; echo b").launch(7, tx).await.unwrap();

        let mut lines = Vec::new();
        let mut finished = None;
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::Line { run, line } => {
                    assert_eq!(run, 7);
                    lines.push(line);
                }
                RunEvent::Finished { run, result } => finished = Some((run, result.unwrap())),
            }
        }
        assert_eq!(lines, vec!["a", "b"]);
        let (run, out) = finished.unwrap();
        assert_eq!(run, 7);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn read_failure_still_reaps_the_child() {
        let mut child = Command::new("sh").args(["-c", "sleep 5"]).spawn().unwrap();
        let err = reap(&mut child, Err(std::io::Error::other("pipe broke")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "pipe broke");
        assert!(child.try_wait().unwrap().is_some());
    }

    #[test]
    fn display_joins_program_and_args() {
        assert_eq!(sh("true").display(), "sh -c true");
    }
}
