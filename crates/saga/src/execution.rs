//! The context handed to step actions and compensations.

use std::collections::BTreeMap;
use std::sync::Arc;

use saga_store::{DataMap, Instance, SagaId, Store};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::definition::{Definition, Step};

/// Context of one step invocation.
///
/// The execution owns a working copy of the step's data. The coordinator
/// writes it back to the persisted step state only when the invocation
/// succeeds, so a failed attempt never leaves partial output behind.
pub struct Execution {
    saga_id: SagaId,
    definition: Arc<Definition>,
    instance: Arc<Instance>,
    step_index: usize,
    attempt: u32,
    data: DataMap,
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    compensating: bool,
}

impl Execution {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        definition: Arc<Definition>,
        instance: Arc<Instance>,
        step_index: usize,
        attempt: u32,
        data: DataMap,
        store: Arc<dyn Store>,
        cancel: CancellationToken,
        compensating: bool,
    ) -> Self {
        Self {
            saga_id: instance.id.clone(),
            definition,
            instance,
            step_index,
            attempt,
            data,
            store,
            cancel,
            compensating,
        }
    }

    pub fn saga_id(&self) -> &SagaId {
        &self.saga_id
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    pub fn step(&self) -> &Step {
        &self.definition.steps[self.step_index]
    }

    pub fn step_name(&self) -> &str {
        &self.step().name
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// 1-based attempt number. For actions this counts attempts across runs.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns true when running a compensation rather than an action.
    pub fn is_compensation(&self) -> bool {
        self.compensating
    }

    /// Snapshot of the instance taken when this invocation started.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The saga input.
    pub fn input(&self) -> &DataMap {
        &self.instance.input
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.instance.metadata
    }

    /// Data recorded by an earlier step.
    pub fn step_data(&self, step_name: &str) -> Option<&DataMap> {
        self.instance
            .steps
            .iter()
            .find(|s| s.name == step_name)
            .map(|s| &s.data)
    }

    pub fn data(&self) -> &DataMap {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataMap {
        &mut self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Reads a data value, deserializing it into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// The store holding this saga, for actions that need to read other sagas.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Fires when the run is cancelled or the step timeout expires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The step's idempotency key, or an empty string if it defines none.
    pub fn idempotency_key(&self) -> String {
        self.step()
            .idempotency_key
            .as_ref()
            .map(|f| f(self))
            .unwrap_or_default()
    }

    pub(crate) fn into_data(self) -> DataMap {
        self.data
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("saga_id", &self.saga_id)
            .field("step", &self.step_name())
            .field("attempt", &self.attempt)
            .field("compensating", &self.compensating)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}
