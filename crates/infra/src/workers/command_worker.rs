//! Stage worker that shells out to an external program.
//!
//! The program learns everything about the attempt through `IM2_*`
//! environment variables and writes its output into `IM2_OUTPUT_DIR`. The
//! categorizing program prints a JSON classification on stdout.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use im2_core::{Classification, JobError, Stage};

use crate::router::{StageSuccess, StageTicket};
use crate::workers::{AttemptControl, StageWorker};

/// Exit status meaning "the input is bad" (`EX_DATAERR`); never retried.
pub const DATA_ERROR_EXIT: i32 = 65;

#[derive(Debug, Clone)]
pub struct CommandStageWorker {
    program: PathBuf,
    args: Vec<String>,
    poll: Duration,
}

impl CommandStageWorker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            poll: Duration::from_millis(100),
        }
    }

    /// Parse a whitespace-separated command line (`program arg1 arg2`).
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts.map(str::to_string)))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }

    fn command(&self, ticket: &StageTicket) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("IM2_JOB_ID", ticket.job_id.to_string())
            .env("IM2_TRACE_ID", ticket.trace_id.to_string())
            .env("IM2_OWNER_ID", ticket.owner_id.as_str())
            .env("IM2_STAGE", ticket.stage.as_str())
            .env("IM2_ATTEMPT", ticket.attempt.to_string())
            .env("IM2_FENCE", ticket.fence.to_string())
            .env("IM2_INPUT", &ticket.input)
            .env("IM2_OUTPUT_DIR", &ticket.workspace)
            .env("IM2_ENGINE", &ticket.config.engine)
            .env("IM2_STAGE_PARAMS", ticket.config.params.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        cmd
    }
}

impl StageWorker for CommandStageWorker {
    fn run(&self, ticket: &StageTicket, control: &AttemptControl) -> Result<StageSuccess, JobError> {
        let mut child = self
            .command(ticket)
            .spawn()
            .map_err(|e| JobError::transient(format!("failed to start {}: {e}", self.program.display())))?;

        let stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(mut out) = stdout {
                let _ = out.read_to_string(&mut buf);
            }
            buf
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if control.should_stop() => {
                    debug!(job_id = %ticket.job_id, stage = %ticket.stage, "stopping stage program");
                    let _ = child.kill();
                    let _ = child.wait();
                    // Grandchildren may still hold stdout open; leave the reader behind.
                    drop(reader);
                    return Err(JobError::transient("stage program stopped"));
                }
                Ok(None) => thread::sleep(self.poll),
                Err(e) => {
                    let _ = child.kill();
                    return Err(JobError::transient(format!("failed to wait for stage program: {e}")));
                }
            }
        };
        let stdout = reader.join().unwrap_or_default();

        if !status.success() {
            return Err(match status.code() {
                Some(DATA_ERROR_EXIT) => JobError::validation(format!("{} rejected its input", ticket.stage)),
                Some(code) => JobError::transient(format!("{} exited with status {code}", ticket.stage)),
                None => JobError::transient(format!("{} was terminated by a signal", ticket.stage)),
            });
        }

        if ticket.stage != Stage::Categorizing {
            return Ok(StageSuccess::default());
        }
        let classification = parse_classification(&stdout)?;
        Ok(StageSuccess {
            classification: Some(classification),
        })
    }
}

/// The last non-empty stdout line must be a JSON classification.
fn parse_classification(stdout: &str) -> Result<Classification, JobError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| JobError::validation("categorizing produced no classification"))?;
    serde_json::from_str(line).map_err(|e| {
        warn!(error = %e, "unparseable classification");
        JobError::validation(format!("invalid classification: {e}"))
    })
}
