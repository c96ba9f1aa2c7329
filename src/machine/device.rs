//! Machines driven by the controller.
//!
//! A `Machine` is the blocking control surface of one device. Calls are
//! synchronous and may take a while, which is why the controller only ever
//! makes them from subtask bodies on worker threads.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::MachineConfig;
use crate::{vlog_debug, Error, Result};

pub trait Machine: Send + Sync {
    fn name(&self) -> &str;
    fn vendor_name(&self) -> &str;
    fn product_name(&self) -> &str;

    /// Bring the device online on the given controller line.
    fn initialize(&self, line_id: usize) -> Result<()>;
    fn uninitialize(&self) -> Result<()>;
    fn restart(&self) -> Result<()>;
    fn is_initialized(&self) -> bool;

    fn is_automatic_read_enabled(&self) -> bool;
    fn set_automatic_read_enabled(&self, enabled: bool) -> Result<()>;
}

/// Operations on which a `SimulatedMachine` can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineOp {
    Initialize,
    Uninitialize,
    Restart,
    AutomaticRead,
}

#[derive(Debug)]
struct SimState {
    line_id: Option<usize>,
    automatic_read: bool,
    restarts: u32,
    failing: HashSet<MachineOp>,
}

/// In-process machine with optional latency and failure injection.
#[derive(Debug)]
pub struct SimulatedMachine {
    name: String,
    vendor: String,
    product: String,
    latency: Duration,
    state: RwLock<SimState>,
}

impl SimulatedMachine {
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            name: config.name.clone(),
            vendor: config.vendor.clone(),
            product: config.product.clone(),
            latency: Duration::ZERO,
            state: RwLock::new(SimState {
                line_id: None,
                automatic_read: true,
                restarts: 0,
                failing: HashSet::new(),
            }),
        }
    }

    /// Every call sleeps for `latency` before acting.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make every subsequent `op` fail until `recover` is called.
    pub fn fail_on(&self, op: MachineOp) {
        self.write().failing.insert(op);
    }

    pub fn recover(&self, op: MachineOp) {
        self.write().failing.remove(&op);
    }

    pub fn line_id(&self) -> Option<usize> {
        self.read().line_id
    }

    pub fn restart_count(&self) -> u32 {
        self.read().restarts
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SimState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SimState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn act<T>(&self, op: MachineOp, f: impl FnOnce(&mut SimState) -> Result<T>) -> Result<T> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let mut state = self.write();
        if state.failing.contains(&op) {
            return Err(Error::Machine(format!("{}: {:?} failed", self.name, op)));
        }
        f(&mut state)
    }
}

impl Machine for SimulatedMachine {
    fn name(&self) -> &str {
        &self.name
    }

    fn vendor_name(&self) -> &str {
        &self.vendor
    }

    fn product_name(&self) -> &str {
        &self.product
    }

    fn initialize(&self, line_id: usize) -> Result<()> {
        self.act(MachineOp::Initialize, |state| {
            state.line_id = Some(line_id);
            vlog_debug!("{} initialized on line {}", self.name, line_id);
            Ok(())
        })
    }

    fn uninitialize(&self) -> Result<()> {
        self.act(MachineOp::Uninitialize, |state| {
            if state.line_id.take().is_none() {
                return Err(Error::Machine(format!("{} is not initialized", self.name)));
            }
            vlog_debug!("{} uninitialized", self.name);
            Ok(())
        })
    }

    fn restart(&self) -> Result<()> {
        self.act(MachineOp::Restart, |state| {
            state.restarts += 1;
            vlog_debug!("{} restarted ({} total)", self.name, state.restarts);
            Ok(())
        })
    }

    fn is_initialized(&self) -> bool {
        self.read().line_id.is_some()
    }

    fn is_automatic_read_enabled(&self) -> bool {
        self.read().automatic_read
    }

    fn set_automatic_read_enabled(&self, enabled: bool) -> Result<()> {
        self.act(MachineOp::AutomaticRead, |state| {
            state.automatic_read = enabled;
            Ok(())
        })
    }
}

struct FleetEntry {
    machine: Arc<dyn Machine>,
    line_id: usize,
}

/// The machines known to the controller, in configuration order.
#[derive(Default)]
pub struct Fleet {
    entries: Vec<FleetEntry>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a fleet of simulated machines from configuration.
    pub fn simulated(configs: &[MachineConfig]) -> Result<Self> {
        let mut fleet = Self::new();
        for config in configs {
            fleet.insert(Arc::new(SimulatedMachine::new(config)), config.line_id)?;
        }
        Ok(fleet)
    }

    pub fn insert(&mut self, machine: Arc<dyn Machine>, line_id: usize) -> Result<()> {
        if self.entries.iter().any(|e| e.machine.name() == machine.name()) {
            return Err(Error::Validation(format!(
                "duplicate machine name: {}",
                machine.name()
            )));
        }
        self.entries.push(FleetEntry { machine, line_id });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Machine>> {
        self.entry(name).map(|e| &e.machine)
    }

    /// Controller line the named machine is configured for.
    pub fn line_id(&self, name: &str) -> Result<usize> {
        self.entry(name).map(|e| e.line_id)
    }

    fn entry(&self, name: &str) -> Result<&FleetEntry> {
        self.entries
            .iter()
            .find(|e| e.machine.name() == name)
            .ok_or_else(|| Error::MachineNotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|e| e.machine.name().to_string())
            .collect()
    }

    pub fn machines(&self) -> impl Iterator<Item = &Arc<dyn Machine>> {
        self.entries.iter().map(|e| &e.machine)
    }

    pub fn initialized(&self) -> Vec<Arc<dyn Machine>> {
        self.machines()
            .filter(|m| m.is_initialized())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
