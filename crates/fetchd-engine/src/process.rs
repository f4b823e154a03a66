use std::process::Stdio;

use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// `code` is `None` and `crashed` true when killed by a signal.
    Exited {
        code: Option<i32>,
        crashed: bool,
        stdout: String,
        stderr: String,
    },
    FailedToStart { message: String },
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(
            self,
            Self::Exited {
                code: Some(0),
                crashed: false,
                ..
            }
        )
    }
}

/// Pending process. Dropping it kills the process.
pub struct ProcessHandle {
    rx: oneshot::Receiver<ProcessOutcome>,
}

impl ProcessHandle {
    pub fn channel() -> (oneshot::Sender<ProcessOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub async fn wait(&mut self) -> ProcessOutcome {
        (&mut self.rx)
            .await
            .unwrap_or_else(|_| ProcessOutcome::FailedToStart {
                message: "process runner dropped the process".to_string(),
            })
    }
}

pub trait ProcessRunner: Send + Sync {
    fn start(&self, program: &str, args: &[String]) -> ProcessHandle;
}

/// Runs commands with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

impl ProcessRunner for TokioProcessRunner {
    fn start(&self, program: &str, args: &[String]) -> ProcessHandle {
        let (mut tx, handle) = ProcessHandle::channel();
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let program = program.to_string();

        tokio::spawn(async move {
            debug!("Running post-download command {}", program);
            let output = tokio::select! {
                output = command.output() => output,
                _ = tx.closed() => {
                    warn!("Post-download command {} abandoned", program);
                    return;
                }
            };
            let outcome = match output {
                Ok(output) => ProcessOutcome::Exited {
                    code: output.status.code(),
                    crashed: output.status.code().is_none(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
                Err(e) => ProcessOutcome::FailedToStart {
                    message: e.to_string(),
                },
            };
            let _ = tx.send(outcome);
        });
        handle
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use parking_lot::Mutex;

    use super::*;

    type Script = Box<dyn Fn(&str, &[String]) -> ProcessOutcome + Send + Sync>;

    /// Answers every start with the outcome of a script and records calls.
    pub struct FakeProcessRunner {
        script: Script,
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FakeProcessRunner {
        pub fn new(script: impl Fn(&str, &[String]) -> ProcessOutcome + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn exiting(code: i32) -> Self {
            Self::new(move |_, _| ProcessOutcome::Exited {
                code: Some(code),
                crashed: false,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().clone()
        }
    }

    impl ProcessRunner for FakeProcessRunner {
        fn start(&self, program: &str, args: &[String]) -> ProcessHandle {
            self.calls.lock().push((program.to_string(), args.to_vec()));
            let (tx, handle) = ProcessHandle::channel();
            let _ = tx.send((self.script)(program, args));
            handle
        }
    }
}
