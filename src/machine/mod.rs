//! Robot-cell application built on the orchestrator.
//!
//! Machine operations (initialize, uninitialize, restart, automatic read)
//! run as composite tasks with one subtask per affected machine. Initialize
//! asks an operator which machine to bring up through the rendezvous board.

mod controller;
mod device;
mod operator;

pub use controller::{Controller, FailureCode, MachineHandler, OperationRecord};
pub use device::{Fleet, Machine, MachineOp, SimulatedMachine};
pub use operator::{
    spawn_operator, AutoOperator, ConsoleOperator, DecisionLog, Operator, OperatorHandle,
    OPERATOR_THREAD,
};
