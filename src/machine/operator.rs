//! External decision makers for rendezvous requests.
//!
//! An `Operator` answers `DecisionRequest`s raised by subtasks that wait on
//! a rendezvous slot. `spawn_operator` runs one on its own thread, pulling
//! requests off the orchestrator's channel and posting each answer back to
//! the slot that asked.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::orchestration::{
    DecisionRequest, HandlerKey, Orchestrator, ANSWER_FIELD, MACHINE_NAME_FIELD,
};
use crate::{vlog, vlog_debug, vlog_warn, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Name of the thread `spawn_operator` starts.
pub const OPERATOR_THREAD: &str = "vrobot-operator";

pub trait Operator: Send {
    /// Produce the payload for `request`. Must contain at least `ANSWER`.
    fn decide(&mut self, request: &DecisionRequest) -> Result<HashMap<String, String>>;
}

/// Question/answer pairs an operator has produced, oldest first.
#[derive(Debug, Default, Clone)]
pub struct DecisionLog {
    entries: Vec<(String, String)>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, question: &str, answer: &str) {
        self.entries.push((question.to_string(), answer.to_string()));
    }

    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|(q, a)| format!("Q: {}\nA: {}", q, a))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Unattended operator.
///
/// Picks the preferred machine when it is among the options, otherwise the
/// first option, and always answers with a fixed value.
#[derive(Debug, Clone)]
pub struct AutoOperator {
    answer: String,
    preferred: Option<String>,
    log: Arc<RwLock<DecisionLog>>,
}

impl AutoOperator {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            preferred: None,
            log: Arc::new(RwLock::new(DecisionLog::new())),
        }
    }

    pub fn with_machine(mut self, name: &str) -> Self {
        self.preferred = Some(name.to_string());
        self
    }

    /// Shared view of every decision made so far.
    pub fn log(&self) -> Arc<RwLock<DecisionLog>> {
        Arc::clone(&self.log)
    }

    fn pick<'a>(&'a self, options: &'a [String]) -> Option<&'a str> {
        match &self.preferred {
            Some(name) if options.contains(name) => Some(name.as_str()),
            _ => options.first().map(String::as_str),
        }
    }
}

impl Operator for AutoOperator {
    fn decide(&mut self, request: &DecisionRequest) -> Result<HashMap<String, String>> {
        let mut fields = HashMap::new();
        fields.insert(ANSWER_FIELD.to_string(), self.answer.clone());
        let machine = self.pick(&request.options).map(str::to_string);
        if let Some(machine) = &machine {
            fields.insert(MACHINE_NAME_FIELD.to_string(), machine.clone());
        }

        if let Ok(mut log) = self.log.write() {
            log.record(
                &format!("{} {:?}", request.key, request.options),
                &format!("{} {}", self.answer, machine.as_deref().unwrap_or("-")),
            );
        }
        Ok(fields)
    }
}

/// Interactive operator reading answers from a line-oriented input.
pub struct ConsoleOperator<R, W> {
    input: R,
    output: W,
}

impl ConsoleOperator<std::io::BufReader<std::io::Stdin>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::BufReader::new(std::io::stdin()), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn prompt(&mut self, text: &str) -> Result<String> {
        write!(self.output, "{}", text)?;
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl<R: BufRead + Send, W: Write + Send> Operator for ConsoleOperator<R, W> {
    fn decide(&mut self, request: &DecisionRequest) -> Result<HashMap<String, String>> {
        writeln!(self.output, "Decision requested by {}", request.key)?;
        for (i, option) in request.options.iter().enumerate() {
            writeln!(self.output, "  [{}] {}", i + 1, option)?;
        }

        let mut fields = HashMap::new();
        if !request.options.is_empty() {
            let choice = self.prompt("Machine (number or name): ")?;
            let machine = match choice.parse::<usize>() {
                Ok(n) if (1..=request.options.len()).contains(&n) => {
                    request.options[n - 1].clone()
                }
                _ => choice,
            };
            fields.insert(MACHINE_NAME_FIELD.to_string(), machine);
        }
        let answer = self.prompt("Confirm [yes/NO]: ")?.to_uppercase();
        fields.insert(ANSWER_FIELD.to_string(), answer);
        Ok(fields)
    }
}

/// Handle to a running operator thread.
pub struct OperatorHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl OperatorHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the thread and wait for it to exit.
    pub fn join(self) {
        self.cancel.cancel();
        if self.join.join().is_err() {
            vlog_warn!("Operator thread panicked");
        }
    }
}

/// Serve `requests` with `operator` on a dedicated thread until the handle
/// is shut down, the orchestrator shuts down, or the channel closes.
///
/// A request the operator fails to answer is posted back empty, which
/// waiters read as a decline.
pub fn spawn_operator<O, H>(
    mut operator: O,
    requests: Receiver<DecisionRequest>,
    orchestrator: Orchestrator<H>,
) -> Result<OperatorHandle>
where
    O: Operator + 'static,
    H: HandlerKey,
{
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let join = std::thread::Builder::new()
        .name(OPERATOR_THREAD.to_string())
        .spawn(move || {
            vlog_debug!("Operator thread started");
            while !token.is_cancelled() && !orchestrator.is_shut_down() {
                let request = match requests.recv_timeout(POLL_INTERVAL) {
                    Ok(request) => request,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                vlog!(
                    "Decision request {} options={:?}",
                    request.key,
                    request.options
                );
                let fields = match operator.decide(&request) {
                    Ok(fields) => fields,
                    Err(e) => {
                        vlog_warn!("Operator failed on {}, declining: {}", request.key, e);
                        HashMap::new()
                    }
                };
                if let Err(e) = orchestrator.post_decision(&request.key, fields) {
                    vlog_warn!("Could not post decision for {}: {}", request.key, e);
                }
            }
            vlog_debug!("Operator thread exiting");
        })?;

    Ok(OperatorHandle { cancel, join })
}
