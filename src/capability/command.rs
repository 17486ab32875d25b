//! External runner process as the host capability.
//!
//! Test runs write their results into the results directory and are picked up
//! by the executor's artifact watcher; the process exit only tells us the run
//! is over. Refreshes have no artifact, so their exit status is the result.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{CapabilityError, EventSink, HostCapability, ResultNode};
use crate::config::CapabilityConfig;
use crate::request::{ExecutionFilter, ItemOutcome};

const STDERR_TAIL: usize = 2_000;

pub struct CommandCapability {
    config: CapabilityConfig,
    results_dir: PathBuf,
}

impl CommandCapability {
    pub fn new(config: CapabilityConfig, results_dir: PathBuf) -> Self {
        Self {
            config,
            results_dir,
        }
    }

    /// Arguments appended after the configured ones for `filter`.
    pub fn filter_args(&self, filter: &ExecutionFilter) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        match filter {
            ExecutionFilter::Tests {
                mode,
                names,
                categories,
            } => {
                args.push("--results-dir".into());
                args.push(self.results_dir.clone().into_os_string());
                args.push("--mode".into());
                args.push(mode.as_str().into());
                if !names.is_empty() {
                    args.push("--filter".into());
                    args.push(names.join(";").into());
                }
                if !categories.is_empty() {
                    args.push("--categories".into());
                    args.push(categories.join(";").into());
                }
            }
            ExecutionFilter::Refresh { paths } => {
                args.push("--refresh".into());
                if !paths.is_empty() {
                    args.push("--paths".into());
                    args.push(paths.join(";").into());
                }
            }
        }
        args
    }
}

impl HostCapability for CommandCapability {
    fn start(
        &self,
        request_id: i64,
        filter: &ExecutionFilter,
        events: EventSink,
    ) -> Result<(), CapabilityError> {
        let program = self.config.program.display().to_string();
        let args = self.filter_args(filter);

        let mut cmd = tokio::process::Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(request_id, %program, ?args, "launching runner");
        let child = cmd.spawn().map_err(|source| CapabilityError::Launch {
            program: program.clone(),
            source,
        })?;
        events.run_started();

        let refresh = matches!(filter, ExecutionFilter::Refresh { .. });
        let started = Instant::now();
        tokio::spawn(async move {
            let request_id = events.request_id();
            let output = child.wait_with_output().await;
            let elapsed = started.elapsed().as_secs_f64();

            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    warn!(request_id, error = %e, "lost track of runner process");
                    events.run_finished(None);
                    return;
                }
            };
            let code = output.status.code();
            info!(request_id, ?code, elapsed_secs = elapsed, "runner exited");

            if !refresh {
                // Results come from the artifact the runner wrote.
                events.run_finished(None);
                return;
            }

            let node = if output.status.success() {
                ResultNode::leaf("asset-refresh", ItemOutcome::Passed, elapsed)
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail = tail_chars(stderr.trim(), STDERR_TAIL);
                let reason = match code {
                    Some(code) => format!("refresh exited with code {code}"),
                    None => "refresh terminated by signal".to_string(),
                };
                let message = if tail.is_empty() {
                    reason
                } else {
                    format!("{reason}: {tail}")
                };
                ResultNode::leaf("asset-refresh", ItemOutcome::Failed, elapsed)
                    .with_message(message)
            };
            events.run_finished(Some(node));
        });

        Ok(())
    }
}

fn tail_chars(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityEvent;
    use crate::host::mailbox::{self, HostMessage};
    use crate::request::TargetMode;
    use std::time::Duration;

    fn capability(program: &str, args: &[&str]) -> CommandCapability {
        CommandCapability::new(
            CapabilityConfig {
                program: PathBuf::from(program),
                args: args.iter().map(|s| s.to_string()).collect(),
                working_dir: None,
            },
            PathBuf::from("out/results"),
        )
    }

    #[test]
    fn test_filter_args_for_test_run() {
        let cap = capability("runner", &[]);
        let filter = ExecutionFilter::Tests {
            mode: TargetMode::PlayMode,
            names: vec!["A.B".into(), "C.D".into()],
            categories: vec![],
        };
        let args: Vec<String> = cap
            .filter_args(&filter)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["--results-dir", "out/results", "--mode", "play-mode", "--filter", "A.B;C.D"]
        );
    }

    #[test]
    fn test_filter_args_for_path_refresh() {
        let cap = capability("runner", &[]);
        let filter = ExecutionFilter::Refresh {
            paths: vec!["Assets/a.png".into(), "Assets/b.png".into()],
        };
        let args: Vec<String> = cap
            .filter_args(&filter)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["--refresh", "--paths", "Assets/a.png;Assets/b.png"]);
    }

    #[test]
    fn test_missing_program_is_launch_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let (mailbox, _inbox) = mailbox::channel(8);
            let cap = capability("/nonexistent/jobrelay-runner", &[]);
            let filter = ExecutionFilter::Refresh { paths: vec![] };
            let err = cap
                .start(1, &filter, EventSink::new(1, mailbox))
                .unwrap_err();
            assert!(matches!(err, CapabilityError::Launch { .. }));
        });
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_refresh_reports_exit_code() {
        let (mailbox, mut inbox) = mailbox::channel(8);
        let cap = capability("sh", &["-c", "echo broken >&2; exit 3", "runner"]);
        let filter = ExecutionFilter::Refresh { paths: vec![] };
        cap.start(7, &filter, EventSink::new(7, mailbox)).unwrap();

        let mut finished = None;
        while finished.is_none() {
            let msg = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
                .await
                .expect("runner did not finish")
                .expect("mailbox closed");
            if let HostMessage::Capability {
                request_id: 7,
                event: CapabilityEvent::RunFinished(node),
            } = msg
            {
                finished = Some(node);
            }
        }

        let node = finished.unwrap().expect("refresh reports a node");
        assert_eq!(node.outcome, ItemOutcome::Failed);
        let message = node.message.unwrap();
        assert!(message.contains("code 3"), "{message}");
        assert!(message.contains("broken"), "{message}");
    }

    #[test]
    fn test_tail_chars_keeps_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("abc", 10), "abc");
    }
}
