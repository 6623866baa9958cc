//! Fractional resource admission control.
//!
//! The [`ResourcePool`] tracks per-type capacity (1.0 = 100% by default)
//! and admits tasks atomically: either every requirement in a task's list
//! fits, or nothing is reserved. The pool never blocks a caller; tasks
//! that cannot be admitted stay pending and are retried on a later
//! scheduling pass.

use crate::core::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Tolerance for floating-point capacity comparisons.
const EPSILON: f64 = 1e-9;

/// The closed set of resource kinds a task may claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Cpu,
    Memory,
    Network,
    Disk,
    Gpu,
    Database,
    Api,
    Model,
}

impl ResourceType {
    /// Every resource type, for iteration and default capacity setup.
    pub const ALL: [ResourceType; 8] = [
        ResourceType::Cpu,
        ResourceType::Memory,
        ResourceType::Network,
        ResourceType::Disk,
        ResourceType::Gpu,
        ResourceType::Database,
        ResourceType::Api,
        ResourceType::Model,
    ];
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Network => "network",
            ResourceType::Disk => "disk",
            ResourceType::Gpu => "gpu",
            ResourceType::Database => "database",
            ResourceType::Api => "api",
            ResourceType::Model => "model",
        };
        write!(f, "{}", name)
    }
}

/// A fractional claim on one resource type.
///
/// `amount` is a fraction of the pool's capacity for that type and is
/// clamped to `[0, 1]` at construction: a single requirement can never ask
/// for more than the entire pool of one type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// The resource type being claimed.
    pub resource: ResourceType,
    /// Fraction of capacity required, in `[0, 1]`.
    pub amount: f64,
    /// Whether the task needs the resource type to itself.
    pub exclusive: bool,
}

impl ResourceRequirement {
    /// Create a shared requirement; `amount` is clamped to `[0, 1]`.
    pub fn new(resource: ResourceType, amount: f64) -> Self {
        Self {
            resource,
            amount: amount.clamp(0.0, 1.0),
            exclusive: false,
        }
    }

    /// Create an exclusive requirement on a resource type.
    ///
    /// Admitted only while the type is entirely free, and blocks all
    /// other admissions for that type while held.
    pub fn exclusive(resource: ResourceType) -> Self {
        Self {
            resource,
            amount: 1.0,
            exclusive: true,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Capacity per type; types absent here use the default of 1.0.
    capacity: HashMap<ResourceType, f64>,
    /// Sum of live allocations per type.
    used: HashMap<ResourceType, f64>,
    /// Types currently held exclusively, with their holder.
    exclusive: HashMap<ResourceType, TaskId>,
    /// Per-task allocation amounts, for release and observability.
    allocations: HashMap<TaskId, HashMap<ResourceType, f64>>,
}

/// Tracks fractional capacity per resource kind and allocates atomically.
///
/// Invariant: for every resource type, the sum of live allocations never
/// exceeds capacity. Mutation is serialized behind a single mutex per
/// pool instance; every operation is a short critical section with no
/// internal waiting.
#[derive(Debug)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
}

impl ResourcePool {
    /// Create a pool with the default capacity of 1.0 for every type.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Create a pool with capacity overrides for specific types.
    pub fn with_capacities(capacities: HashMap<ResourceType, f64>) -> Self {
        let pool = Self::new();
        {
            let mut state = pool.state.lock().expect("resource pool lock poisoned");
            for (resource, capacity) in capacities {
                state.capacity.insert(resource, capacity.max(0.0));
            }
        }
        pool
    }

    fn capacity_of(state: &PoolState, resource: ResourceType) -> f64 {
        state.capacity.get(&resource).copied().unwrap_or(1.0)
    }

    /// Attempt atomic admission of all requirements for a task.
    ///
    /// Returns false (reserving nothing) if the task already holds an
    /// allocation, or if any single requirement would overflow its type's
    /// remaining capacity, or conflicts with an exclusive hold. Duplicate
    /// types within one request accumulate before the feasibility check.
    pub fn allocate(&self, task_id: &TaskId, requirements: &[ResourceRequirement]) -> bool {
        if requirements.is_empty() {
            return true;
        }
        let mut state = self.state.lock().expect("resource pool lock poisoned");

        if state.allocations.contains_key(task_id) {
            debug!(task = %task_id, "allocation rejected: task already holds resources");
            return false;
        }

        // Accumulate the request per type before checking anything.
        let mut requested: HashMap<ResourceType, (f64, bool)> = HashMap::new();
        for req in requirements {
            let entry = requested.entry(req.resource).or_insert((0.0, false));
            entry.0 += req.amount.clamp(0.0, 1.0);
            entry.1 |= req.exclusive;
        }

        // Feasibility pass: nothing is reserved unless everything fits.
        for (&resource, &(amount, exclusive)) in &requested {
            let used = state.used.get(&resource).copied().unwrap_or(0.0);
            if state.exclusive.contains_key(&resource) {
                debug!(task = %task_id, %resource, "allocation rejected: exclusively held");
                return false;
            }
            if exclusive {
                if used > EPSILON {
                    debug!(task = %task_id, %resource, used, "exclusive allocation rejected: type in use");
                    return false;
                }
            } else if used + amount > Self::capacity_of(&state, resource) + EPSILON {
                debug!(
                    task = %task_id, %resource, used, amount,
                    "allocation rejected: would exceed capacity"
                );
                return false;
            }
        }

        // Commit.
        let mut held = HashMap::new();
        for (resource, (amount, exclusive)) in requested {
            *state.used.entry(resource).or_insert(0.0) += amount;
            if exclusive {
                state.exclusive.insert(resource, task_id.clone());
            }
            held.insert(resource, amount);
        }
        state.allocations.insert(task_id.clone(), held);
        debug!(task = %task_id, "resources allocated");
        true
    }

    /// Free everything a task holds.
    ///
    /// Returns the amounts released per type (empty if the task held
    /// nothing).
    pub fn release(&self, task_id: &TaskId) -> HashMap<ResourceType, f64> {
        let mut state = self.state.lock().expect("resource pool lock poisoned");
        let Some(held) = state.allocations.remove(task_id) else {
            return HashMap::new();
        };
        for (&resource, &amount) in &held {
            if let Some(used) = state.used.get_mut(&resource) {
                *used = (*used - amount).max(0.0);
            }
        }
        state
            .exclusive
            .retain(|_, holder| holder != task_id);
        debug!(task = %task_id, "resources released");
        held
    }

    /// Remaining capacity per resource type.
    ///
    /// Exclusively held types report 0.0 regardless of amounts.
    pub fn available(&self) -> HashMap<ResourceType, f64> {
        let state = self.state.lock().expect("resource pool lock poisoned");
        ResourceType::ALL
            .iter()
            .map(|&resource| {
                let remaining = if state.exclusive.contains_key(&resource) {
                    0.0
                } else {
                    let used = state.used.get(&resource).copied().unwrap_or(0.0);
                    (Self::capacity_of(&state, resource) - used).max(0.0)
                };
                (resource, remaining)
            })
            .collect()
    }

    /// Whether the requirements could be admitted into an otherwise empty
    /// pool.
    ///
    /// Distinguishes "held right now" from "can never fit" for callers
    /// polling a contended pool. Mirrors [`ResourcePool::allocate`]:
    /// duplicate types accumulate, and an exclusive claim fits any empty
    /// pool regardless of capacity overrides.
    pub fn is_satisfiable(&self, requirements: &[ResourceRequirement]) -> bool {
        let state = self.state.lock().expect("resource pool lock poisoned");
        let mut requested: HashMap<ResourceType, (f64, bool)> = HashMap::new();
        for req in requirements {
            let entry = requested.entry(req.resource).or_insert((0.0, false));
            entry.0 += req.amount.clamp(0.0, 1.0);
            entry.1 |= req.exclusive;
        }
        requested.iter().all(|(&resource, &(amount, exclusive))| {
            exclusive || amount <= Self::capacity_of(&state, resource) + EPSILON
        })
    }

    /// What a task currently holds, per type.
    pub fn allocation(&self, task_id: &TaskId) -> HashMap<ResourceType, f64> {
        let state = self.state.lock().expect("resource pool lock poisoned");
        state.allocations.get(task_id).cloned().unwrap_or_default()
    }
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self::new()
    }
}
