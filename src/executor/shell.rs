// Shell Executor
// Runs jobs in a persistent shell session so state accumulated by earlier
// jobs of the same task (exported variables, shell functions) stays visible
// to later ones. `with_reset(true)` tears the session down between jobs.
//
// Each job is written to the session's stdin as a frame terminated by
// sentinel lines on stdout (carrying the exit status) and stderr; output is
// streamed line-wise into the job's writers until the sentinels arrive.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::executor::{Executor, Job};
use crate::template::render_string;
use crate::variables::Variables;

const SHELL_BIN: &str = "/bin/sh";

pub struct ShellExecutor {
    session: Option<ShellSession>,
    reset: bool,
    frame_counter: u64,
}

struct ShellSession {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Lines<BufReader<ChildStderr>>,
}

enum LoopEnd {
    Completed(i32),
    Closed,
    Canceled,
    TimedOut,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            session: None,
            reset: false,
            frame_counter: 0,
        }
    }

    async fn execute_interactive(
        &self,
        cancel: &CancelToken,
        job: &Job,
        command: &str,
    ) -> Result<Vec<u8>> {
        let mut cmd = Command::new(SHELL_BIN);
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd.env_clear();
        for (key, value) in job.env.string_map() {
            cmd.env(key, value);
        }
        if let Some(dir) = &job.dir {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let deadline = job.timeout.map(|t| tokio::time::Instant::now() + t);

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(Error::Canceled)
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(Error::Timeout)
            }
            status = child.wait() => {
                let status = status?;
                match status.code() {
                    Some(0) => Ok(Vec::new()),
                    Some(code) => Err(Error::ExitStatus {
                        code,
                        stderr: String::new(),
                    }),
                    None => Err(Error::CommandFailed("shell terminated by signal".to_string())),
                }
            }
        }
    }

    async fn drop_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.kill().await;
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    async fn execute(&mut self, cancel: &CancelToken, job: &Job) -> Result<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }

        let command = render_string(&job.command, &job.vars)?;

        if job.interactive {
            return self.execute_interactive(cancel, job, &command).await;
        }

        if self.reset {
            self.drop_session().await;
        }
        if self.session.is_none() {
            self.session = Some(ShellSession::spawn(&job.env, job.dir.as_deref())?);
        }

        self.frame_counter += 1;
        let out_sentinel = format!("__CONVEYOR_RC_{}_", self.frame_counter);
        let err_sentinel = format!("__CONVEYOR_EOS_{}_", self.frame_counter);
        let frame = build_frame(&command, job.dir.as_deref(), &out_sentinel, &err_sentinel);

        let deadline = job.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut captured: Vec<u8> = Vec::new();
        let mut stderr_captured = String::new();
        let mut stdout_writer = job.stdout.clone();
        let mut stderr_writer = job.stderr.clone();

        let end = {
            let session = self
                .session
                .as_mut()
                .ok_or_else(|| Error::CommandFailed("shell session unavailable".to_string()))?;

            // a dead session surfaces as EOF on stdout below
            let _ = session.stdin.write_all(frame.as_bytes()).await;
            let _ = session.stdin.flush().await;

            let mut status: Option<i32> = None;
            let mut err_done = false;

            loop {
                if let Some(code) = status {
                    if err_done {
                        break LoopEnd::Completed(code);
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break LoopEnd::Canceled,
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                        break LoopEnd::TimedOut;
                    }
                    line = session.stdout.next_line(), if status.is_none() => match line {
                        Ok(Some(line)) => {
                            if let Some(idx) = line.find(&out_sentinel) {
                                let prefix = &line[..idx];
                                if !prefix.is_empty() {
                                    let _ = std::io::Write::write_all(&mut stdout_writer, prefix.as_bytes());
                                    captured.extend_from_slice(prefix.as_bytes());
                                }
                                let code = line[idx + out_sentinel.len()..].trim().parse::<i32>().unwrap_or(-1);
                                status = Some(code);
                            } else {
                                let _ = std::io::Write::write_all(&mut stdout_writer, line.as_bytes());
                                let _ = std::io::Write::write_all(&mut stdout_writer, b"\n");
                                captured.extend_from_slice(line.as_bytes());
                                captured.push(b'\n');
                            }
                        }
                        Ok(None) => break LoopEnd::Closed,
                        Err(err) => return Err(Error::Io(err)),
                    },
                    line = session.stderr.next_line(), if !err_done => match line {
                        Ok(Some(line)) => {
                            if let Some(idx) = line.find(&err_sentinel) {
                                let prefix = &line[..idx];
                                if !prefix.is_empty() {
                                    let _ = std::io::Write::write_all(&mut stderr_writer, prefix.as_bytes());
                                    stderr_captured.push_str(prefix);
                                }
                                err_done = true;
                            } else {
                                let _ = std::io::Write::write_all(&mut stderr_writer, line.as_bytes());
                                let _ = std::io::Write::write_all(&mut stderr_writer, b"\n");
                                stderr_captured.push_str(&line);
                                stderr_captured.push('\n');
                            }
                        }
                        Ok(None) | Err(_) => err_done = true,
                    },
                }
            }
        };

        match end {
            LoopEnd::Completed(0) => Ok(captured),
            LoopEnd::Completed(code) => Err(Error::ExitStatus {
                code,
                stderr: stderr_captured,
            }),
            LoopEnd::Closed => {
                // the shell itself exited: an explicit `exit` or a fatal
                // parse error ends the whole session
                let Some(mut session) = self.session.take() else {
                    return Err(Error::CommandFailed("shell session unavailable".to_string()));
                };
                while let Ok(Some(line)) = session.stderr.next_line().await {
                    if line.contains(&err_sentinel) {
                        continue;
                    }
                    let _ = std::io::Write::write_all(&mut stderr_writer, line.as_bytes());
                    let _ = std::io::Write::write_all(&mut stderr_writer, b"\n");
                    stderr_captured.push_str(&line);
                    stderr_captured.push('\n');
                }
                let status = session.child.wait().await?;
                match status.code() {
                    Some(0) => Ok(captured),
                    Some(code) => Err(Error::ExitStatus {
                        code,
                        stderr: stderr_captured,
                    }),
                    None => Err(Error::CommandFailed("shell terminated by signal".to_string())),
                }
            }
            LoopEnd::Canceled => {
                self.drop_session().await;
                Err(Error::Canceled)
            }
            LoopEnd::TimedOut => {
                self.drop_session().await;
                Err(Error::Timeout)
            }
        }
    }

    fn with_reset(&mut self, reset: bool) {
        self.reset = reset;
    }
}

impl ShellSession {
    fn spawn(env: &Variables, dir: Option<&Path>) -> Result<Self> {
        let mut cmd = Command::new(SHELL_BIN);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.env_clear();
        for (key, value) in env.string_map() {
            cmd.env(key, value);
        }
        if let Some(dir) = dir {
            if dir.is_dir() {
                cmd.current_dir(dir);
            }
        }
        // own process group, so cancellation can kill the whole tree
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            stderr: BufReader::new(stderr).lines(),
        })
    }

    async fn kill(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::killpg(pid as i32, libc::SIGKILL);
            }
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

fn far_future() -> tokio::time::Instant {
    tokio::time::Instant::now() + Duration::from_secs(86400 * 365)
}

fn build_frame(command: &str, dir: Option<&Path>, out_sentinel: &str, err_sentinel: &str) -> String {
    let mut frame = String::new();
    if let Some(dir) = dir {
        frame.push_str("cd ");
        frame.push_str(&shell_quote(&dir.display().to_string()));
        frame.push('\n');
    }
    frame.push_str(command);
    frame.push('\n');
    frame.push_str("__conveyor_rc=$?\n");
    frame.push_str(&format!(
        "printf '%s%d\\n' '{out_sentinel}' \"$__conveyor_rc\"\n"
    ));
    frame.push_str(&format!("printf '%s\\n' '{err_sentinel}' >&2\n"));
    frame
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::SafeWriter;

    fn job_with_env(command: &str) -> Job {
        let mut job = Job::from_command(command);
        job.env = Variables::from_map(std::env::vars());
        job.stdout = SafeWriter::sink();
        job.stderr = SafeWriter::sink();
        job
    }

    #[tokio::test]
    async fn test_execute_success() {
        let mut executor = ShellExecutor::new();
        let job = job_with_env("echo 'success'");

        let out = executor.execute(&CancelToken::new(), &job).await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("success"));
        assert!(job.stdout.string().contains("success"));
    }

    #[tokio::test]
    async fn test_execute_exit_status() {
        let mut executor = ShellExecutor::new();
        let job = job_with_env("exit 1");

        let err = executor.execute(&CancelToken::new(), &job).await.unwrap_err();
        assert_eq!(err.exit_status(), Some(1));
    }

    #[tokio::test]
    async fn test_nonzero_builtin_keeps_session_usable() {
        let mut executor = ShellExecutor::new();

        let err = executor
            .execute(&CancelToken::new(), &job_with_env("false"))
            .await
            .unwrap_err();
        assert_eq!(err.exit_status(), Some(1));

        let out = executor
            .execute(&CancelToken::new(), &job_with_env("echo alive"))
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&out).contains("alive"));
    }

    #[tokio::test]
    async fn test_missing_template_variable_fails() {
        let mut executor = ShellExecutor::new();
        let job = job_with_env("echo {{ .Fail }}");

        let err = executor.execute(&CancelToken::new(), &job).await.unwrap_err();
        assert!(matches!(err, Error::Render(_)));
    }

    #[tokio::test]
    async fn test_multiline_output() {
        let mut executor = ShellExecutor::new();
        let job = job_with_env("printf '%s\\nLine-2\\n' '=========== Line 1 =================='");

        executor.execute(&CancelToken::new(), &job).await.unwrap();
        let out = job.stdout.string();
        assert!(out.contains("Line 1"));
        assert!(out.contains("Line-2"));
    }

    #[tokio::test]
    async fn test_stderr_is_routed_separately() {
        let mut executor = ShellExecutor::new();
        let job = job_with_env("echo error >&2");

        executor.execute(&CancelToken::new(), &job).await.unwrap();
        assert!(job.stderr.string().contains("error"));
        assert!(!job.stdout.string().contains("error"));
    }

    #[tokio::test]
    async fn test_shell_state_persists_without_reset() {
        let mut executor = ShellExecutor::new();

        executor
            .execute(&CancelToken::new(), &job_with_env("greet() { echo from-func; }"))
            .await
            .unwrap();
        let out = executor
            .execute(&CancelToken::new(), &job_with_env("greet"))
            .await
            .unwrap();

        assert!(String::from_utf8_lossy(&out).contains("from-func"));
    }

    #[tokio::test]
    async fn test_reset_discards_shell_state() {
        let mut executor = ShellExecutor::new();
        executor.with_reset(true);

        executor
            .execute(&CancelToken::new(), &job_with_env("greet() { echo from-func; }"))
            .await
            .unwrap();
        let err = executor
            .execute(&CancelToken::new(), &job_with_env("greet"))
            .await
            .unwrap_err();

        // the function is gone; sh reports command-not-found as exit 127
        assert_eq!(err.exit_status(), Some(127));
    }

    #[tokio::test]
    async fn test_session_env_pinned_until_reset() {
        let mut executor = ShellExecutor::new();

        let mut first = job_with_env("echo $V");
        first.env.set("V", "one");
        executor.execute(&CancelToken::new(), &first).await.unwrap();

        let mut second = job_with_env("echo $V");
        second.env.set("V", "two");
        executor.execute(&CancelToken::new(), &second).await.unwrap();

        // without reset, the session keeps the env it was spawned with
        assert_eq!(first.stdout.string(), "one\n");
        assert_eq!(second.stdout.string(), "one\n");
    }

    #[tokio::test]
    async fn test_reset_applies_each_jobs_env() {
        let mut executor = ShellExecutor::new();
        executor.with_reset(true);

        for expected in ["one", "two"] {
            let mut job = job_with_env("echo $V");
            job.env.set("V", expected);
            executor.execute(&CancelToken::new(), &job).await.unwrap();
            assert_eq!(job.stdout.string(), format!("{expected}\n"));
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let mut executor = ShellExecutor::new();
        let mut job = job_with_env("sleep 5");
        job.timeout = Some(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = executor.execute(&CancelToken::new(), &job).await.unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_aborts_job() {
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let mut executor = ShellExecutor::new();
        let job = job_with_env("sleep 5");

        let started = std::time::Instant::now();
        let err = executor.execute(&cancel, &job).await.unwrap_err();
        assert!(matches!(err, Error::Canceled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_job_dir_applies() {
        let dir = tempfile::tempdir().unwrap();
        let mut executor = ShellExecutor::new();
        let mut job = job_with_env("pwd");
        job.dir = Some(dir.path().to_path_buf());

        executor.execute(&CancelToken::new(), &job).await.unwrap();
        let expected = dir.path().canonicalize().unwrap();
        let got = std::path::PathBuf::from(job.stdout.string().trim().to_string());
        assert_eq!(got.canonicalize().unwrap_or(got), expected);
    }
}
