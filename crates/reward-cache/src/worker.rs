use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Runtime;

use crate::protocol::{OracleRequest, OracleResponse};
use crate::types::{OracleConfig, OracleError, OracleOutcome};

struct OracleProcess {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    started_at: Instant,
}

/// A long-lived oracle child process spoken to over JSON lines.
///
/// Calls are blocking: the worker owns a current-thread tokio runtime and
/// drives each request to completion. The process is spawned on first use,
/// restarted after `max_requests_per_worker` requests, and killed and
/// dropped when a request times out or the process dies; the next request
/// spawns a fresh one.
pub struct OracleWorker {
    runtime: Runtime,
    process: Option<OracleProcess>,
    requests_handled: u64,
    config: OracleConfig,
}

impl OracleWorker {
    pub fn new(config: &OracleConfig) -> Result<Self, OracleError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            process: None,
            requests_handled: 0,
            config: config.clone(),
        })
    }

    fn spawn_process(config: &OracleConfig) -> Result<OracleProcess, OracleError> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        // Own process group: a terminal Ctrl-C reaches only the trainer, which
        // finishes the batch in flight before stopping.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn()?;

        let stdin = BufWriter::new(
            child
                .stdin
                .take()
                .ok_or_else(|| OracleError::Protocol("Failed to capture stdin".into()))?,
        );
        let stdout = BufReader::new(
            child
                .stdout
                .take()
                .ok_or_else(|| OracleError::Protocol("Failed to capture stdout".into()))?,
        );

        tracing::debug!(program = %config.program.display(), "Spawned oracle worker");
        Ok(OracleProcess {
            child,
            stdin,
            stdout,
            started_at: Instant::now(),
        })
    }

    /// Requests answered by the current process.
    pub fn requests_handled(&self) -> u64 {
        self.requests_handled
    }

    /// OS pid of the current process, if one is running.
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(|p| p.child.id())
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    pub fn needs_recycling(&self) -> bool {
        self.process.is_some() && self.requests_handled >= self.config.max_requests_per_worker
    }

    /// Kill the current process, if any. The next request spawns a new one.
    pub fn shutdown(&mut self) {
        if let Some(mut process) = self.process.take() {
            let alive_secs = process.started_at.elapsed().as_secs();
            self.runtime.block_on(async {
                let _ = process.child.kill().await;
                let _ = process.child.wait().await;
            });
            tracing::debug!(alive_secs, requests = self.requests_handled, "Stopped oracle worker");
        }
        self.requests_handled = 0;
    }

    /// Send one request and wait for its outcome.
    ///
    /// The hard deadline is the request's own `timeout_secs` plus the
    /// configured grace period.
    pub fn request(&mut self, request: &OracleRequest) -> Result<OracleOutcome, OracleError> {
        let json = request
            .to_json()
            .map_err(|e| OracleError::Protocol(format!("Serialization error: {e}")))?;
        if self.needs_recycling() {
            tracing::debug!(requests = self.requests_handled, "Recycling oracle worker");
            self.shutdown();
        }
        let deadline = request.timeout_secs() + self.config.grace_secs;
        let line = self.send_line(&json, deadline)?;
        OracleResponse::parse(line.trim())?.into_outcome()
    }

    fn send_line(&mut self, json: &str, timeout_secs: u64) -> Result<String, OracleError> {
        if self.process.is_none() {
            let config = &self.config;
            let process = self.runtime.block_on(async { Self::spawn_process(config) })?;
            self.process = Some(process);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(OracleError::ProcessDied);
        };

        let result = self.runtime.block_on(async {
            process.stdin.write_all(json.as_bytes()).await?;
            process.stdin.write_all(b"\n").await?;
            process.stdin.flush().await?;

            let mut line = String::new();
            let read = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                process.stdout.read_line(&mut line),
            )
            .await;
            Ok::<_, std::io::Error>(read.map(|r| r.map(|n| (n, line))))
        });

        match result {
            Ok(Ok(Ok((0, _)))) => {
                self.shutdown();
                Err(OracleError::ProcessDied)
            }
            Ok(Ok(Ok((_, line)))) => {
                self.requests_handled += 1;
                Ok(line)
            }
            Ok(Ok(Err(e))) | Err(e) => {
                self.shutdown();
                Err(OracleError::Io(e))
            }
            Ok(Err(_)) => {
                tracing::warn!(timeout_secs, "Oracle timed out, recycling worker");
                self.shutdown();
                Err(OracleError::Timeout(timeout_secs))
            }
        }
    }
}

impl Drop for OracleWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str, grace_secs: u64) -> OracleConfig {
        OracleConfig {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into()],
            timeout_secs: 0,
            grace_secs,
            max_requests_per_worker: 3,
            ..OracleConfig::default()
        }
    }

    fn dfa_request() -> OracleRequest {
        OracleRequest::Dfa {
            ground_truth: "a".into(),
            candidate: "a".into(),
            timeout_secs: 0,
        }
    }

    #[test]
    fn test_echo_oracle() {
        let script = r#"while read line; do echo '{"reward": 1.0, "coverage": true, "match": true}'; done"#;
        let mut worker = OracleWorker::new(&sh(script, 5)).unwrap();
        assert!(!worker.is_running());
        for _ in 0..2 {
            let outcome = worker.request(&dfa_request()).unwrap();
            assert_eq!(outcome.reward, 1.0);
            assert!(outcome.exact_match);
        }
        assert!(worker.is_running());
        assert_eq!(worker.requests_handled(), 2);
    }

    #[test]
    fn test_recycles_after_max_requests() {
        let script = r#"while read line; do echo '{"reward": 0.0, "coverage": false, "match": false}'; done"#;
        let mut worker = OracleWorker::new(&sh(script, 5)).unwrap();
        for _ in 0..3 {
            worker.request(&dfa_request()).unwrap();
        }
        assert!(worker.needs_recycling());
        worker.request(&dfa_request()).unwrap();
        assert_eq!(worker.requests_handled(), 1);
    }

    #[test]
    fn test_error_response_is_rejected() {
        let script = r#"while read line; do echo '{"error": "bad sketch"}'; done"#;
        let mut worker = OracleWorker::new(&sh(script, 5)).unwrap();
        assert!(matches!(
            worker.request(&dfa_request()),
            Err(OracleError::Rejected(_))
        ));
    }

    #[test]
    fn test_process_exit_is_reported() {
        let mut worker = OracleWorker::new(&sh("read line; exit 0", 5)).unwrap();
        assert!(matches!(
            worker.request(&dfa_request()),
            Err(OracleError::ProcessDied)
        ));
        assert!(!worker.is_running());
    }

    /// Process group id from `/proc/<pid>/stat`.
    #[cfg(target_os = "linux")]
    fn process_group_of(pid: u32) -> u32 {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        let after_name = &stat[stat.rfind(')').unwrap() + 1..];
        after_name.split_whitespace().nth(2).unwrap().parse().unwrap()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_oracle_runs_in_its_own_process_group() {
        let script = r#"while read line; do echo '{"reward": 1.0, "coverage": true, "match": false}'; done"#;
        let mut worker = OracleWorker::new(&sh(script, 5)).unwrap();
        worker.request(&dfa_request()).unwrap();

        let pid = worker.process_id().unwrap();
        assert_eq!(process_group_of(pid), pid);
        // Terminal Ctrl-C goes to the foreground group, which is ours.
        assert_ne!(process_group_of(pid), process_group_of(std::process::id()));
        assert!(worker.request(&dfa_request()).unwrap().coverage);
    }

    #[test]
    fn test_timeout_kills_process() {
        let mut worker = OracleWorker::new(&sh("read line; sleep 30", 1)).unwrap();
        let started = Instant::now();
        assert!(matches!(
            worker.request(&dfa_request()),
            Err(OracleError::Timeout(1))
        ));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!worker.is_running());
    }
}
