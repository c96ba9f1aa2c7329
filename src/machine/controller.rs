//! Machine operations expressed as composite tasks.

use chrono::{DateTime, Utc};
use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::device::{Fleet, Machine};
use crate::config::Config;
use crate::orchestration::{
    subtask, Completion, DecisionRequest, HandlerTable, Orchestrator, OrchestratorOptions,
    QueueId, QueueRegistry, Status, SubtaskCallback, SubtaskCode, SubtaskContext, TaskId,
    SUBTASK_OK,
};
use crate::util::lock;
use crate::{vlog, vlog_debug, vlog_error, vlog_warn, Error, Result};

/// Non-zero subtask codes reported by machine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum FailureCode {
    /// The operator answered something other than the affirmative value.
    Declined = 1,
    DeviceError = 2,
    DecisionTimeout = 3,
    UnknownMachine = 4,
    NotInitialized = 5,
    /// The fleet is empty, so there is nothing to initialize.
    NoMachines = 6,
}

impl FailureCode {
    pub fn code(self) -> SubtaskCode {
        self as SubtaskCode
    }

    pub fn from_code(code: SubtaskCode) -> Option<Self> {
        match code {
            1 => Some(Self::Declined),
            2 => Some(Self::DeviceError),
            3 => Some(Self::DecisionTimeout),
            4 => Some(Self::UnknownMachine),
            5 => Some(Self::NotInitialized),
            6 => Some(Self::NoMachines),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Declined => "declined by operator",
            Self::DeviceError => "device error",
            Self::DecisionTimeout => "no decision in time",
            Self::UnknownMachine => "unknown machine",
            Self::NotInitialized => "machine not initialized",
            Self::NoMachines => "no machine configured",
        };
        f.write_str(text)
    }
}

/// Completion handlers registered by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineHandler {
    Initialized,
    Uninitialized,
    Restarted,
    AutomaticReadChanged,
}

impl MachineHandler {
    pub const ALL: [MachineHandler; 4] = [
        MachineHandler::Initialized,
        MachineHandler::Uninitialized,
        MachineHandler::Restarted,
        MachineHandler::AutomaticReadChanged,
    ];
}

/// A finished machine operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub handler: MachineHandler,
    pub queue: QueueId,
    pub task: TaskId,
    pub status: Status,
    pub finished_at: DateTime<Utc>,
}

impl OperationRecord {
    pub fn successful(&self) -> bool {
        self.status.successful()
    }

    /// Named failures, in subtask order. Codes outside `FailureCode` are
    /// skipped.
    pub fn failures(&self) -> Vec<FailureCode> {
        self.status
            .failures()
            .filter_map(|(_, code)| FailureCode::from_code(code))
            .collect()
    }
}

#[derive(Default)]
struct ControllerState {
    selected: Option<String>,
    /// Machine picked by each initialize task that is still in flight.
    chosen: HashMap<TaskId, String>,
    /// Most recent records, oldest first, at most `history_limit` long.
    history: VecDeque<OperationRecord>,
}

struct Shared {
    state: Mutex<ControllerState>,
    finished: Notify,
    history_limit: usize,
}

impl Shared {
    fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(ControllerState::default()),
            finished: Notify::new(),
            history_limit: history_limit.max(1),
        }
    }

    fn on_completion(&self, completion: &Completion<MachineHandler>) {
        let mut state = lock(&self.state);
        let chosen = state.chosen.remove(&completion.task);
        if completion.status.successful() {
            match completion.handler {
                MachineHandler::Initialized => {
                    if let Some(name) = chosen {
                        vlog!("Machine {} selected", name);
                        state.selected = Some(name);
                    }
                }
                MachineHandler::Uninitialized => state.selected = None,
                MachineHandler::Restarted | MachineHandler::AutomaticReadChanged => {}
            }
        } else {
            vlog_warn!(
                "{:?} on {} finished with status {}",
                completion.handler,
                completion.queue,
                completion.status
            );
        }
        if state.history.len() == self.history_limit {
            state.history.pop_front();
        }
        state.history.push_back(OperationRecord {
            handler: completion.handler,
            queue: completion.queue.clone(),
            task: completion.task,
            status: completion.status.clone(),
            finished_at: Utc::now(),
        });
        drop(state);
        self.finished.notify_waiters();
    }

    fn find(&self, task: TaskId) -> Option<OperationRecord> {
        lock(&self.state)
            .history
            .iter()
            .find(|r| r.task == task)
            .cloned()
    }
}

/// Drives a fleet of machines through the orchestrator.
#[derive(Clone)]
pub struct Controller {
    orchestrator: Orchestrator<MachineHandler>,
    fleet: Arc<Fleet>,
    shared: Arc<Shared>,
    confirm_answer: Arc<str>,
}

impl Controller {
    /// Start an orchestrator over the configured queues.
    ///
    /// Returns the controller and the decision-request stream an operator
    /// must serve for `initialize` to make progress.
    pub fn start(config: &Config, fleet: Fleet) -> Result<(Self, Receiver<DecisionRequest>)> {
        config.validate()?;
        let shared = Arc::new(Shared::new(config.history_limit));

        let mut handlers = HandlerTable::new();
        for handler in MachineHandler::ALL {
            let shared = Arc::clone(&shared);
            handlers.register(handler, move |_, completion: &Completion<MachineHandler>| {
                shared.on_completion(completion)
            })?;
        }

        let mut registry = QueueRegistry::builder();
        registry.register_all(config.queues.iter().map(String::as_str))?;

        let (orchestrator, requests) = Orchestrator::start(
            registry,
            handlers,
            OrchestratorOptions {
                max_workers: config.max_workers,
                decision_timeout: config.decision_timeout(),
            },
        )?;

        vlog!(
            "Controller started: {} machine(s), queues {:?}",
            fleet.len(),
            config.queues
        );

        Ok((
            Self {
                orchestrator,
                fleet: Arc::new(fleet),
                shared,
                confirm_answer: Arc::from(config.confirm_answer.as_str()),
            },
            requests,
        ))
    }

    /// Bring one machine online.
    ///
    /// With several machines the operator picks one through a decision
    /// request. A single machine is initialized without asking, and an
    /// empty fleet fails with `NoMachines`.
    pub fn initialize(&self, queue: &str) -> Result<TaskId> {
        let fleet = Arc::clone(&self.fleet);
        let shared = Arc::clone(&self.shared);
        let confirm = Arc::clone(&self.confirm_answer);

        let body = match fleet.names().as_slice() {
            [] => subtask(|_| {
                vlog_error!("No machine configuration found");
                FailureCode::NoMachines.code()
            }),
            [only] => {
                let name = only.clone();
                subtask(move |ctx| bring_online(&ctx, &fleet, &shared, &name))
            }
            _ => subtask(move |ctx| initialize_selected(&ctx, &fleet, &shared, &confirm)),
        };
        self.orchestrator
            .enqueue(queue, vec![body], MachineHandler::Initialized)
    }

    /// Take every initialized machine offline, one subtask per machine.
    pub fn uninitialize(&self, queue: &str) -> Result<TaskId> {
        let subtasks = self.per_initialized_machine(|machine| {
            machine.uninitialize().map(|_| SUBTASK_OK)
        });
        self.orchestrator
            .enqueue(queue, subtasks, MachineHandler::Uninitialized)
    }

    /// Restart every machine in the fleet in parallel.
    pub fn restart(&self, queue: &str) -> Result<TaskId> {
        let subtasks = self
            .fleet
            .machines()
            .map(|machine| {
                let machine = Arc::clone(machine);
                subtask(move |_| device_code(machine.name(), machine.restart().map(|_| SUBTASK_OK)))
            })
            .collect();
        self.orchestrator
            .enqueue(queue, subtasks, MachineHandler::Restarted)
    }

    pub fn set_automatic_read(&self, queue: &str, enabled: bool) -> Result<TaskId> {
        let subtasks = self.per_initialized_machine(move |machine| {
            machine
                .set_automatic_read_enabled(enabled)
                .map(|_| SUBTASK_OK)
        });
        self.orchestrator
            .enqueue(queue, subtasks, MachineHandler::AutomaticReadChanged)
    }

    /// One subtask per machine initialized right now, or a single
    /// `NotInitialized` subtask if there are none. Each subtask re-checks
    /// its machine before acting.
    fn per_initialized_machine<F>(&self, op: F) -> Vec<SubtaskCallback>
    where
        F: Fn(&dyn Machine) -> Result<SubtaskCode> + Clone + Send + 'static,
    {
        let machines = self.fleet.initialized();
        if machines.is_empty() {
            return vec![subtask(|_| FailureCode::NotInitialized.code())];
        }
        machines
            .into_iter()
            .map(|machine| {
                let op = op.clone();
                subtask(move |_| {
                    if !machine.is_initialized() {
                        return FailureCode::NotInitialized.code();
                    }
                    device_code(machine.name(), op(machine.as_ref()))
                })
            })
            .collect()
    }

    /// Wait until `task` has retired and return its record.
    pub async fn wait_for(&self, task: TaskId, timeout: Duration) -> Result<OperationRecord> {
        let wait = async {
            loop {
                let finished = self.shared.finished.notified();
                tokio::pin!(finished);
                finished.as_mut().enable();
                if let Some(record) = self.shared.find(task) {
                    return record;
                }
                finished.await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout(timeout))
    }

    /// Finished operations in retirement order.
    ///
    /// Only the latest `history_limit` records are kept. `wait_for` cannot
    /// find a task whose record has already been dropped.
    pub fn history(&self) -> Vec<OperationRecord> {
        lock(&self.shared.state).history.iter().cloned().collect()
    }

    /// Machine picked by the last successful initialize, if still online.
    pub fn selected(&self) -> Option<String> {
        lock(&self.shared.state).selected.clone()
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn orchestrator(&self) -> &Orchestrator<MachineHandler> {
        &self.orchestrator
    }

    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }
}

fn initialize_selected(
    ctx: &SubtaskContext,
    fleet: &Fleet,
    shared: &Shared,
    confirm: &str,
) -> SubtaskCode {
    let decision = match ctx.request_decision(fleet.names()) {
        Ok(decision) => decision,
        Err(Error::RendezvousTimeout { key, .. }) => {
            vlog_warn!("No operator decision for {}", key);
            return FailureCode::DecisionTimeout.code();
        }
        Err(e) => {
            vlog_warn!("Decision request {} failed: {}", ctx.key(), e);
            return FailureCode::DeviceError.code();
        }
    };

    if !decision.is_affirmative(confirm) {
        vlog_debug!("Operator declined initialize ({:?})", decision.answer());
        return FailureCode::Declined.code();
    }
    let Some(name) = decision.machine_name() else {
        return FailureCode::UnknownMachine.code();
    };
    bring_online(ctx, fleet, shared, name)
}

fn bring_online(ctx: &SubtaskContext, fleet: &Fleet, shared: &Shared, name: &str) -> SubtaskCode {
    let (machine, line_id) = match (fleet.get(name), fleet.line_id(name)) {
        (Ok(machine), Ok(line_id)) => (machine, line_id),
        _ => {
            vlog_warn!("Unknown machine {}", name);
            return FailureCode::UnknownMachine.code();
        }
    };

    let code = device_code(name, machine.initialize(line_id).map(|_| SUBTASK_OK));
    if code == SUBTASK_OK {
        lock(&shared.state).chosen.insert(ctx.task(), name.to_string());
    }
    code
}

fn device_code(machine: &str, result: Result<SubtaskCode>) -> SubtaskCode {
    match result {
        Ok(code) => code,
        Err(e) => {
            vlog_warn!("{}: {}", machine, e);
            FailureCode::DeviceError.code()
        }
    }
}
