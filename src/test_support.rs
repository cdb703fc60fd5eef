//! A launcher whose helpers replay scripted replies instead of running `ntlm_auth`.
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::helper::{HelperCommand, HelperConnection, HelperLauncher};
use crate::AuthError;

/// What the next helper interaction does
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// The next read returns this raw line
    Reply(String),
    /// The next read hits EOF
    Eof,
    /// The next write only gets half the line through
    ShortWrite,
    /// The next write fails with a broken pipe
    WriteError,
}

impl Step {
    pub(crate) fn reply(line: &str) -> Step {
        Step::Reply(line.to_owned())
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    written: Vec<String>,
    spawned: usize,
    terminated: usize,
    failing_spawns: usize,
}

/// Hands out connections that all share one script
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedLauncher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLauncher {
    pub(crate) fn new() -> ScriptedLauncher {
        ScriptedLauncher::default()
    }

    pub(crate) fn push(&self, step: Step) {
        self.script.lock().steps.push_back(step);
    }

    pub(crate) fn reply(&self, line: &str) {
        self.push(Step::reply(line));
    }

    pub(crate) fn fail_next_spawn(&self) {
        self.script.lock().failing_spawns += 1;
    }

    /// Every line helpers have received so far
    pub(crate) fn written(&self) -> Vec<String> {
        self.script.lock().written.clone()
    }

    pub(crate) fn spawned(&self) -> usize {
        self.script.lock().spawned
    }

    pub(crate) fn terminated(&self) -> usize {
        self.script.lock().terminated
    }

    /// Steps not consumed yet
    pub(crate) fn pending(&self) -> usize {
        self.script.lock().steps.len()
    }
}

impl HelperLauncher for ScriptedLauncher {
    fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperConnection>, AuthError> {
        let mut script = self.script.lock();
        if script.failing_spawns > 0 {
            script.failing_spawns -= 1;
            return Err(AuthError::Spawn {
                program: command.program().to_owned(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such helper"),
            });
        }
        script.spawned += 1;
        Ok(Box::new(ScriptedConnection {
            script: Arc::clone(&self.script),
            pid: script.spawned as u32,
            terminated: false,
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Mutex<Script>>,
    pid: u32,
    terminated: bool,
}

impl HelperConnection for ScriptedConnection {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<usize> {
        let mut script = self.script.lock();
        match script.steps.front() {
            Some(Step::ShortWrite) => {
                script.steps.pop_front();
                Ok(line.len() / 2)
            }
            Some(Step::WriteError) => {
                script.steps.pop_front();
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "helper went away"))
            }
            _ => {
                script.written.push(String::from_utf8_lossy(line).into_owned());
                Ok(line.len())
            }
        }
    }

    fn read_line(&mut self, max_len: usize) -> io::Result<Option<String>> {
        match self.script.lock().steps.pop_front() {
            Some(Step::Reply(mut line)) => {
                line.truncate(max_len);
                Ok(Some(line))
            }
            Some(Step::Eof) | None => Ok(None),
            Some(step) => panic!("read with {:?} scripted next", step),
        }
    }

    fn terminate(&mut self) {
        if !self.terminated {
            self.terminated = true;
            self.script.lock().terminated += 1;
        }
    }
}
