//! Subprocess supervision: spawning, timeout enforcement, and concurrent
//! script lifecycle management.

use crate::trace::{ConcurrentMode, StdinSource, Trace};
use log::{debug, warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Runs a single trace to completion. The supervisor owns the child process
/// handle for the entire run, so a trace can never be left behind unreaped.
///
/// The traced process is polled without blocking so that the concurrent
/// script launch delay and the timeout deadline are honored with millisecond
/// granularity.
pub struct Supervisor {
    poll_interval: Duration,
    /// Polling cadence after a client-mode SIGINT failed to stop the process.
    settle_interval: Duration,
    /// Time granted after a client-mode SIGINT before falling back to
    /// deadline polling.
    sigint_grace: Duration,
}

impl Default for Supervisor {
    fn default() -> Self {
        Supervisor {
            poll_interval: Duration::from_millis(1),
            settle_interval: Duration::from_secs(1),
            sigint_grace: Duration::from_secs(5),
        }
    }
}

impl Supervisor {
    /// Spawn the trace's binary and supervise it until exit or timeout,
    /// recording the outcome on the trace.
    ///
    /// The trace working directory must already be populated: scripts,
    /// input files, and the stdin file are the executor's responsibility.
    pub fn run(&self, trace: &mut Trace) -> Result<(), SupervisorError> {
        let stdin = match stdin_path(trace) {
            Some(path) => Stdio::from(File::open(path)?),
            None => Stdio::null(),
        };

        let mut child = Command::new(trace.spawn_target())
            .args(&trace.arguments)
            .current_dir(trace.launch_dir())
            .envs(trace.env_vars())
            .stdin(stdin)
            .stdout(File::create(trace.stdout_path())?)
            .stderr(File::create(trace.stderr_path())?)
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: trace.binary.clone(),
                source,
            })?;

        let start = Instant::now();
        trace.start_time = Some(start);
        trace.pid = Some(child.id());
        debug!("spawned {} (pid {})", trace, child.id());

        let deadline = start + Duration::from_secs(trace.context.template.timeout.seconds);
        let concurrent = trace.context.template.concurrent.clone();
        let launch_at = concurrent
            .as_ref()
            .map(|hook| start + Duration::from_secs_f64(hook.delay));
        let mut helper: Option<Child> = None;

        let outcome = loop {
            if let Some(status) = child.try_wait()? {
                break Outcome::Exited(status);
            }

            let now = Instant::now();
            if let (Some(hook), Some(at)) = (&concurrent, launch_at) {
                if helper.is_none() && now >= at {
                    let script = self.spawn_concurrent(trace)?;
                    trace.concurrent_pid = Some(script.id());

                    if hook.mode == ConcurrentMode::Client {
                        break self.await_client(trace, &mut child, script, hook.delay, deadline)?;
                    }
                    helper = Some(script);
                }
            }

            if now >= deadline {
                break Outcome::TimedOut;
            }
            thread::sleep(self.poll_interval);
        };

        match outcome {
            Outcome::Exited(status) => {
                trace.wait_status = Some(status);
                debug!("{} exited: {:?}", trace, status);
            }
            Outcome::TimedOut => {
                let status = self.terminate(&mut child)?;
                trace.wait_status = Some(status);
                trace.timed_out = true;
                debug!("{} timed out after {}s", trace, trace.context.template.timeout.seconds);
            }
        }

        if let Some(script) = helper {
            self.reap_concurrent(trace, script, deadline)?;
        }
        Ok(())
    }

    fn spawn_concurrent(&self, trace: &Trace) -> Result<Child, SupervisorError> {
        let output = File::create(trace.concurrent_script_output())?;
        let child = Command::new("/bin/bash")
            .arg(trace.concurrent_script_path())
            .current_dir(trace.launch_dir())
            .envs(trace.env_vars())
            .stdin(Stdio::null())
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::from(output))
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                binary: trace.concurrent_script_path(),
                source,
            })?;
        debug!("{} concurrent script started (pid {})", trace, child.id());
        Ok(child)
    }

    /// Client-mode completion: the concurrent script drives the trace. Once
    /// it exits the traced process gets a grace window, then SIGINT, then
    /// plain deadline polling until the overall timeout.
    fn await_client(
        &self,
        trace: &mut Trace,
        child: &mut Child,
        mut script: Child,
        grace: f64,
        deadline: Instant,
    ) -> Result<Outcome, SupervisorError> {
        // Wait for either process, script first.
        let script_status = loop {
            if let Some(status) = script.try_wait()? {
                break Some(status);
            }
            if let Some(status) = child.try_wait()? {
                // The traced process finished on its own. The script no
                // longer has a peer to talk to, so stop it.
                trace.concurrent_exit_code = self.terminate(&mut script)?.code();
                return Ok(Outcome::Exited(status));
            }
            if Instant::now() >= deadline {
                trace.concurrent_exit_code = self.terminate(&mut script)?.code();
                return Ok(Outcome::TimedOut);
            }
            thread::sleep(self.poll_interval);
        };
        trace.concurrent_exit_code = script_status.and_then(|status| status.code());

        // Grace window for the traced process to notice the client is gone.
        let grace_end = Instant::now() + Duration::from_secs_f64(grace);
        if let Some(status) = self.poll_until(child, grace_end.min(deadline), self.poll_interval)? {
            return Ok(Outcome::Exited(status));
        }

        // Ask the traced process to shut down.
        if let Some(pid) = trace.pid {
            debug!("{} sending SIGINT after client exit", trace);
            send_signal(pid, Signal::SIGINT);
        }
        let sigint_end = Instant::now() + self.sigint_grace;
        if let Some(status) = self.poll_until(child, sigint_end.min(deadline), self.poll_interval)? {
            return Ok(Outcome::Exited(status));
        }

        // Still running. Fall back to coarse polling until the deadline.
        match self.poll_until(child, deadline, self.settle_interval)? {
            Some(status) => Ok(Outcome::Exited(status)),
            None => Ok(Outcome::TimedOut),
        }
    }

    fn poll_until(
        &self,
        child: &mut Child,
        until: Instant,
        interval: Duration,
    ) -> io::Result<Option<ExitStatus>> {
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= until {
                return Ok(None);
            }
            thread::sleep(interval);
        }
    }

    /// SIGTERM the child and reap it, escalating to SIGKILL if it does not
    /// exit within the grace period.
    fn terminate(&self, child: &mut Child) -> io::Result<ExitStatus> {
        send_signal(child.id(), Signal::SIGTERM);
        let until = Instant::now() + self.sigint_grace;
        if let Some(status) = self.poll_until(child, until, self.poll_interval)? {
            return Ok(status);
        }
        warn!("pid {} ignored SIGTERM, killing", child.id());
        child.kill()?;
        child.wait()
    }

    /// Reap a detached concurrent script at the end of a trace. A script
    /// that outlived the traced process gets the remaining trace timeout,
    /// at least 5 seconds, to finish on its own before it is terminated.
    fn reap_concurrent(
        &self,
        trace: &mut Trace,
        mut script: Child,
        deadline: Instant,
    ) -> io::Result<()> {
        let wait = deadline
            .saturating_duration_since(Instant::now())
            .max(self.sigint_grace);
        let status = match self.poll_until(&mut script, Instant::now() + wait, self.poll_interval)? {
            Some(status) => status,
            None => {
                debug!("{} concurrent script still running, terminating", trace);
                self.terminate(&mut script)?
            }
        };
        trace.concurrent_exit_code = status.code();
        Ok(())
    }
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
}

/// Resolve the path the traced process's stdin is read from, if any.
fn stdin_path(trace: &Trace) -> Option<PathBuf> {
    match &trace.context.template.stdin {
        StdinSource::Empty => None,
        StdinSource::Template(_) => Some(trace.default_stdin_path()),
        StdinSource::File(path) => {
            if path.is_absolute() {
                Some(path.clone())
            } else {
                Some(trace.cwd.join(path))
            }
        }
    }
}

/// Best-effort signal delivery. A missing process is not an error; it raced
/// us to exit and will be reaped by the caller.
fn send_signal(pid: u32, sig: Signal) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), sig) {
        debug!("signal {} to pid {} failed: {}", sig, pid, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{Comparator, FuzzVariable};
    use crate::render::Template;
    use crate::trace::{ConcurrentHook, TimeoutConstraint, TraceContext, TraceTemplate};
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;

    fn template(timeout: u64, concurrent: Option<ConcurrentHook>) -> Arc<TraceTemplate> {
        Arc::new(TraceTemplate {
            id: "t01".to_string(),
            name: "test".to_string(),
            summary: String::new(),
            arguments: Template::compile("").unwrap(),
            variables: Vec::<Box<dyn FuzzVariable>>::new(),
            comparators: Vec::<Box<dyn Comparator>>::new(),
            expect_success: true,
            expect_signal: 0,
            timeout: TimeoutConstraint {
                seconds: timeout,
                expected: false,
            },
            stdin: StdinSource::Empty,
            input_files: Vec::new(),
            setup: None,
            teardown: None,
            concurrent,
        })
    }

    fn shell_trace(
        dir: &std::path::Path,
        body: &str,
        timeout: u64,
        concurrent: Option<ConcurrentHook>,
    ) -> Trace {
        let context = Arc::new(TraceContext {
            template: template(timeout, concurrent),
            id: "t01-001".to_string(),
            values: BTreeMap::new(),
            arguments: String::new(),
        });
        let mut trace = Trace::new(
            PathBuf::from("/bin/sh"),
            context,
            dir.to_path_buf(),
            "engine",
        );
        trace.arguments = vec!["-c".to_string(), body.to_string()];
        trace
    }

    fn write_concurrent_script(trace: &Trace, body: &str) {
        let path = trace.concurrent_script_path();
        std::fs::write(&path, format!("#!/bin/bash\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn records_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = shell_trace(dir.path(), "exit 7", 10, None);
        Supervisor::default().run(&mut trace).unwrap();

        assert_eq!(trace.exit_code(), Some(7));
        assert!(!trace.timed_out);
        assert!(trace.pid.is_some());
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = shell_trace(dir.path(), "echo out; echo err >&2", 10, None);
        Supervisor::default().run(&mut trace).unwrap();

        assert_eq!(trace.read_stdout().unwrap(), b"out\n");
        assert_eq!(trace.read_stderr().unwrap(), b"err\n");
    }

    #[test]
    fn detects_signal_crashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = shell_trace(dir.path(), "kill -SEGV $$", 10, None);
        Supervisor::default().run(&mut trace).unwrap();

        assert_eq!(trace.crash_signal(), Some(11));
        assert_eq!(trace.exit_code(), Some(-11));
        assert!(!trace.timed_out);
    }

    #[test]
    fn enforces_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut trace = shell_trace(dir.path(), "sleep 30", 1, None);
        Supervisor::default().run(&mut trace).unwrap();

        assert!(trace.timed_out);
        assert_eq!(trace.crash_signal(), Some(15));
    }

    #[test]
    fn detached_concurrent_script_runs_and_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let hook = ConcurrentHook {
            script: Template::compile("touch marker").unwrap(),
            mode: ConcurrentMode::Detached,
            delay: 0.1,
            retries: 0,
        };
        let mut trace = shell_trace(dir.path(), "sleep 1", 10, Some(hook));
        write_concurrent_script(&trace, "echo helper; touch marker");
        Supervisor::default().run(&mut trace).unwrap();

        assert_eq!(trace.exit_code(), Some(0));
        assert_eq!(trace.concurrent_exit_code, Some(0));
        assert!(trace.concurrent_pid.is_some());
        assert!(dir.path().join("marker").exists());
        assert_eq!(
            std::fs::read(trace.concurrent_script_output()).unwrap(),
            b"helper\n"
        );
    }

    #[test]
    fn client_script_exit_interrupts_the_trace() {
        let dir = tempfile::tempdir().unwrap();
        let hook = ConcurrentHook {
            script: Template::compile("exit 3").unwrap(),
            mode: ConcurrentMode::Client,
            delay: 0.2,
            retries: 0,
        };
        // exec so the sleep replaces the shell and SIGINT lands on the
        // process the supervisor signals.
        let mut trace = shell_trace(dir.path(), "exec sleep 30", 10, Some(hook));
        write_concurrent_script(&trace, "exit 3");

        let started = Instant::now();
        Supervisor::default().run(&mut trace).unwrap();

        assert_eq!(trace.concurrent_exit_code, Some(3));
        assert_eq!(trace.crash_signal(), Some(2));
        assert!(!trace.timed_out);
        // Grace window plus SIGINT, nowhere near the 10s timeout.
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn client_mode_records_trace_exit_before_script() {
        let dir = tempfile::tempdir().unwrap();
        let hook = ConcurrentHook {
            script: Template::compile("sleep 30").unwrap(),
            mode: ConcurrentMode::Client,
            delay: 0.1,
            retries: 0,
        };
        let mut trace = shell_trace(dir.path(), "sleep 0.5; exit 4", 10, Some(hook));
        write_concurrent_script(&trace, "sleep 30");
        Supervisor::default().run(&mut trace).unwrap();

        assert_eq!(trace.exit_code(), Some(4));
        assert!(!trace.timed_out);
    }
}
