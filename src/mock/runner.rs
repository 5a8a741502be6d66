//! Scripted [`Runner`]
//!
//! Responses are keyed by a substring of the rendered command line. The
//! most recently added matching rule wins; unmatched commands exit 0 with
//! no output. Every command is recorded.

use std::sync::{Arc, Mutex, MutexGuard};

use charms_process::{CommandSpec, ProcessOutput, ProcessResult, RunControl, Runner};

type Responder = Arc<dyn Fn(&CommandSpec) -> ProcessOutput + Send + Sync>;

#[derive(Default)]
struct State {
    rules: Vec<(String, Responder)>,
    calls: Vec<CommandSpec>,
}

#[derive(Default)]
pub struct MockRunner {
    state: Mutex<State>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commands containing `needle` produce `output`
    pub fn respond(&self, needle: &str, output: ProcessOutput) {
        self.respond_with(needle, move |_| output.clone());
    }

    /// Commands containing `needle` are answered by `f`, which may also
    /// touch the filesystem the way the real tool would
    pub fn respond_with<F>(&self, needle: &str, f: F)
    where
        F: Fn(&CommandSpec) -> ProcessOutput + Send + Sync + 'static,
    {
        self.lock().rules.push((needle.to_string(), Arc::new(f)));
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.lock().calls.clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.to_string().contains(needle))
            .count()
    }
}

impl Runner for MockRunner {
    fn run(&self, spec: &CommandSpec, _control: &RunControl) -> ProcessResult<ProcessOutput> {
        let line = spec.to_string();
        let responder = {
            let mut state = self.lock();
            state.calls.push(spec.clone());
            state
                .rules
                .iter()
                .rev()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, r)| Arc::clone(r))
        };
        Ok(match responder {
            Some(r) => r(spec),
            None => ProcessOutput::exited(0, "", ""),
        })
    }
}
