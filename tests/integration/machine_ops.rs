//! Machine operation tests.
//!
//! These tests drive simulated machines through the controller with an
//! unattended operator and check both device state and the recorded
//! operation history.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vrobot::machine::{
    spawn_operator, AutoOperator, FailureCode, Machine, MachineHandler, MachineOp, Operator,
    OPERATOR_THREAD,
};
use vrobot::orchestration::DecisionRequest;
use vrobot::{Error, Result};

use crate::fixtures::{test_config, Cell, TEST_TIMEOUT};

/// Test: Unattended initialize
/// Given two machines and an operator that confirms "rv4f"
/// When initialize runs on queue A
/// Then rv4f is initialized on its configured line and becomes selected
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialize_selected_machine() {
    let cell = Cell::new(&test_config(&["rv2f", "rv4f"]));
    let operator = spawn_operator(
        AutoOperator::new("YES").with_machine("rv4f"),
        cell.requests.clone(),
        cell.controller.orchestrator().clone(),
    )
    .unwrap();

    let task = cell.controller.initialize("A").unwrap();
    let record = cell.controller.wait_for(task, TEST_TIMEOUT).await.unwrap();

    assert!(record.successful());
    assert_eq!(record.handler, MachineHandler::Initialized);
    assert_eq!(cell.controller.selected().as_deref(), Some("rv4f"));
    assert!(!cell.machines[0].is_initialized());
    assert!(cell.machines[1].is_initialized());
    assert_eq!(cell.machines[1].line_id(), Some(2));

    operator.join();
}

/// Test: Operator declines
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_declined_initialize_changes_nothing() {
    let cell = Cell::new(&test_config(&["rv2f", "rv4f"]));
    let operator = spawn_operator(
        AutoOperator::new("NO"),
        cell.requests.clone(),
        cell.controller.orchestrator().clone(),
    )
    .unwrap();

    let task = cell.controller.initialize("A").unwrap();
    let record = cell.controller.wait_for(task, TEST_TIMEOUT).await.unwrap();

    assert_eq!(record.failures(), vec![FailureCode::Declined]);
    assert!(cell.controller.selected().is_none());
    assert!(cell.controller.fleet().initialized().is_empty());

    operator.join();
}

/// Test: Operator names a machine outside the fleet
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialize_unknown_machine() {
    let cell = Cell::new(&test_config(&["rv2f", "rv4f"]));
    let key = {
        let task = cell.controller.initialize("A").unwrap();
        let requests = cell.requests.clone();
        let request = tokio::task::spawn_blocking(move || requests.recv_timeout(TEST_TIMEOUT))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.key.task, task);
        assert_eq!(request.options, vec!["rv2f".to_string(), "rv4f".to_string()]);
        request.key
    };

    let fields = [("ANSWER", "YES"), ("MACHINE_NAME", "ghost")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    cell.controller
        .orchestrator()
        .post_decision(&key, fields)
        .unwrap();

    let record = cell.controller.wait_for(key.task, TEST_TIMEOUT).await.unwrap();
    assert_eq!(record.failures(), vec![FailureCode::UnknownMachine]);
}

/// Test: Device failure during initialize
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialize_device_error() {
    let cell = Cell::new(&test_config(&["rv2f", "rv4f"]));
    cell.machines[0].fail_on(MachineOp::Initialize);
    let operator = spawn_operator(
        AutoOperator::new("YES").with_machine("rv2f"),
        cell.requests.clone(),
        cell.controller.orchestrator().clone(),
    )
    .unwrap();

    let task = cell.controller.initialize("A").unwrap();
    let record = cell.controller.wait_for(task, TEST_TIMEOUT).await.unwrap();
    assert_eq!(record.failures(), vec![FailureCode::DeviceError]);
    assert!(cell.controller.selected().is_none());

    operator.join();
}

/// Test: No operator answers in time
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_initialize_times_out_without_operator() {
    let mut config = test_config(&["rv2f", "rv4f"]);
    config.decision_timeout_secs = 1;
    let cell = Cell::new(&config);

    let task = cell.controller.initialize("A").unwrap();
    let record = cell
        .controller
        .wait_for(task, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.failures(), vec![FailureCode::DecisionTimeout]);
}

/// Test: A lone machine is initialized without asking
/// Given a fleet of one machine and no operator
/// When initialize runs
/// Then it succeeds at once and no decision request is published
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_machine_initializes_without_decision() {
    let cell = Cell::new(&test_config(&["only"]));

    let start = Instant::now();
    let task = cell.controller.initialize("A").unwrap();
    let record = cell
        .controller
        .wait_for(task, Duration::from_secs(2))
        .await
        .unwrap();

    assert!(record.successful());
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(cell.controller.selected().as_deref(), Some("only"));
    assert_eq!(cell.machines[0].line_id(), Some(1));
    assert!(cell.requests.try_recv().is_err());
    assert!(cell.controller.orchestrator().pending_decisions("A").unwrap().is_empty());
}

/// Test: An empty fleet fails without asking
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_empty_fleet_fails_without_decision() {
    let cell = Cell::new(&test_config(&[]));

    let task = cell.controller.initialize("A").unwrap();
    let record = cell
        .controller
        .wait_for(task, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(record.failures(), vec![FailureCode::NoMachines]);
    assert!(cell.controller.selected().is_none());
    assert!(cell.requests.try_recv().is_err());
}

/// Operator that cannot answer, noting the thread it was asked on.
struct BrokenOperator {
    threads: Arc<Mutex<Vec<Option<String>>>>,
}

impl Operator for BrokenOperator {
    fn decide(&mut self, _request: &DecisionRequest) -> Result<HashMap<String, String>> {
        let name = std::thread::current().name().map(str::to_string);
        self.threads.lock().unwrap().push(name);
        Err(Error::Validation("console closed".into()))
    }
}

/// Test: A failing operator declines instead of leaving the subtask blocked
/// Given an operator whose decide always errors and a 5s decision timeout
/// When initialize runs on a two-machine fleet
/// Then the task retires with Declined well before the timeout, and the
/// operator ran on its named thread
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operator_error_declines() {
    let cell = Cell::new(&test_config(&["rv2f", "rv4f"]));
    let threads = Arc::new(Mutex::new(Vec::new()));
    let operator = spawn_operator(
        BrokenOperator {
            threads: Arc::clone(&threads),
        },
        cell.requests.clone(),
        cell.controller.orchestrator().clone(),
    )
    .unwrap();

    let task = cell.controller.initialize("A").unwrap();
    let record = cell
        .controller
        .wait_for(task, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(record.failures(), vec![FailureCode::Declined]);
    assert!(cell.controller.fleet().initialized().is_empty());
    assert_eq!(
        *threads.lock().unwrap(),
        vec![Some(OPERATOR_THREAD.to_string())]
    );

    operator.join();
}

/// Test: Restart fans out to every machine
/// Given three machines, one of which fails to restart
/// When restart runs
/// Then every machine was asked and only the broken one is reported
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_fans_out() {
    let cell = Cell::new(&test_config(&["a", "b", "c"]));
    cell.machines[1].fail_on(MachineOp::Restart);

    let task = cell.controller.restart("B").unwrap();
    let record = cell.controller.wait_for(task, TEST_TIMEOUT).await.unwrap();

    assert_eq!(record.queue.as_str(), "B");
    assert_eq!(record.status.codes(), &[0, FailureCode::DeviceError.code(), 0]);
    assert_eq!(cell.machines[0].restart_count(), 1);
    assert_eq!(cell.machines[1].restart_count(), 0);
    assert_eq!(cell.machines[2].restart_count(), 1);
}

/// Test: Automatic read needs an initialized machine
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_automatic_read_without_initialized_machine() {
    let cell = Cell::new(&test_config(&["rv2f"]));

    let task = cell.controller.set_automatic_read("A", false).unwrap();
    let record = cell.controller.wait_for(task, TEST_TIMEOUT).await.unwrap();

    assert_eq!(record.failures(), vec![FailureCode::NotInitialized]);
    assert!(cell.machines[0].is_automatic_read_enabled());
}

/// Test: A full session lands in history in retirement order
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_history() {
    let cell = Cell::new(&test_config(&["rv2f", "rv4f"]));
    let operator = spawn_operator(
        AutoOperator::new("YES"),
        cell.requests.clone(),
        cell.controller.orchestrator().clone(),
    )
    .unwrap();
    let controller = &cell.controller;

    let init = controller.initialize("A").unwrap();
    controller.wait_for(init, TEST_TIMEOUT).await.unwrap();

    let read_off = controller.set_automatic_read("A", false).unwrap();
    let restart = controller.restart("B").unwrap();
    controller.wait_for(read_off, TEST_TIMEOUT).await.unwrap();
    controller.wait_for(restart, TEST_TIMEOUT).await.unwrap();
    assert!(!cell.machines[0].is_automatic_read_enabled());
    assert!(cell.machines[1].is_automatic_read_enabled());

    let uninit = controller.uninitialize("A").unwrap();
    let record = controller.wait_for(uninit, TEST_TIMEOUT).await.unwrap();
    assert!(record.successful());
    assert!(controller.selected().is_none());
    assert!(controller.fleet().initialized().is_empty());

    let history = controller.history();
    assert_eq!(history.len(), 4);
    assert!(history.iter().all(|r| r.successful()));
    assert_eq!(history[0].handler, MachineHandler::Initialized);
    assert_eq!(history[3].handler, MachineHandler::Uninitialized);
    let on_a: Vec<_> = history
        .iter()
        .filter(|r| r.queue.as_str() == "A")
        .map(|r| r.handler)
        .collect();
    assert_eq!(
        on_a,
        vec![
            MachineHandler::Initialized,
            MachineHandler::AutomaticReadChanged,
            MachineHandler::Uninitialized
        ]
    );

    controller.shutdown();
    operator.join();
}
