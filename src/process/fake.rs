//! Scripted `ProcessRunner` for unit tests.
//!
//! Rules match on the rendered command line prefix. A rule with several
//! replies hands them out in order and then repeats the last one. Commands
//! that match no rule succeed with empty output.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CommandSpec, ProcessOutput, ProcessRunner};
use crate::errors::ProcessError;

#[derive(Debug, Clone)]
pub enum Reply {
    Output(ProcessOutput),
    /// Never completes; used to exercise deadlines.
    Hang,
    /// The binary could not be spawned.
    Missing,
    /// Blocks until the gate is notified, then succeeds with empty output.
    Gated(Arc<tokio::sync::Notify>),
}

impl Reply {
    pub fn ok(stdout: &str) -> Self {
        Self::Output(ProcessOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn fail(code: i32, stderr: &str) -> Self {
        Self::Output(ProcessOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }
}

struct Rule {
    prefix: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, prefix: &str, reply: Reply) -> Self {
        self.on_seq(prefix, vec![reply])
    }

    pub fn on_seq(self, prefix: &str, replies: Vec<Reply>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            prefix: prefix.to_string(),
            replies: replies.into(),
        });
        self
    }

    /// Rendered command lines, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    pub fn specs(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    fn reply_for(&self, line: &str) -> Option<Reply> {
        let mut rules = self.rules.lock().unwrap();
        let rule = rules.iter_mut().find(|r| line.starts_with(&r.prefix))?;
        if rule.replies.len() > 1 {
            rule.replies.pop_front()
        } else {
            rule.replies.front().cloned()
        }
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        let line = spec.to_string();
        self.calls.lock().unwrap().push(spec.clone());
        match self.reply_for(&line) {
            Some(Reply::Output(out)) => Ok(out),
            Some(Reply::Hang) => std::future::pending().await,
            Some(Reply::Missing) => Err(ProcessError::Spawn {
                command: line,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            }),
            Some(Reply::Gated(gate)) => {
                gate.notified().await;
                Ok(ProcessOutput {
                    code: Some(0),
                    ..Default::default()
                })
            }
            None => Ok(ProcessOutput {
                code: Some(0),
                ..Default::default()
            }),
        }
    }
}
