use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// What a handler knows about the fire it is serving.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Engine job id; carries the `-temp-` suffix for immediate runs.
    pub job_id: String,
    pub scheduled_at: DateTime<Utc>,
}

/// A unit of work the engine can fire.
///
/// Implementors are built from the job's JSON parameter bag and must be safe
/// to run concurrently with other instances of themselves.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run once. The returned string is stored as the record's `retval`.
    async fn main(&self, ctx: &TaskContext) -> anyhow::Result<String>;
}

type Factory =
    Arc<dyn Fn(Value) -> std::result::Result<Box<dyn TaskHandler>, String> + Send + Sync>;

/// Maps handler references such as `reports.DailyDigest` to constructors.
///
/// The text before the last `.` is the module, the rest is the symbol; the
/// split only matters for choosing which "not found" error to report.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `H` under `key`, constructing it by deserialising the
    /// parameter bag into `H`.
    pub fn register<H>(&self, key: &str)
    where
        H: TaskHandler + DeserializeOwned + 'static,
    {
        self.register_factory(key, |params| {
            serde_json::from_value::<H>(params)
                .map(|h| Box::new(h) as Box<dyn TaskHandler>)
                .map_err(|e| e.to_string())
        });
    }

    /// Register a custom constructor. Returning `Err` is reported as a
    /// parameter error.
    pub fn register_factory<F>(&self, key: &str, factory: F)
    where
        F: Fn(Value) -> std::result::Result<Box<dyn TaskHandler>, String> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().expect("handler registry poisoned");
        if factories.insert(key.to_string(), Arc::new(factory)).is_some() {
            debug!(handler = %key, "handler factory replaced");
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories
            .read()
            .expect("handler registry poisoned")
            .contains_key(key)
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .factories
            .read()
            .expect("handler registry poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Build a fresh handler instance for one fire.
    pub fn resolve(&self, handler_ref: &str, raw_params: &str) -> Result<Box<dyn TaskHandler>> {
        let factory = {
            let factories = self.factories.read().expect("handler registry poisoned");
            match factories.get(handler_ref) {
                Some(f) => Arc::clone(f),
                None => return Err(Self::miss(&factories, handler_ref)),
            }
        };

        let param_error = |reason: String| SchedulerError::HandlerParamError {
            params: raw_params.to_string(),
            reason,
        };
        let params = if raw_params.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_str::<Value>(raw_params).map_err(|e| param_error(e.to_string()))?
        };
        if !params.is_object() {
            return Err(param_error("parameters must be a JSON object".to_string()));
        }

        factory(params).map_err(param_error)
    }

    fn miss(factories: &HashMap<String, Factory>, handler_ref: &str) -> SchedulerError {
        let (module, symbol) = match handler_ref.rsplit_once('.') {
            Some((module, symbol)) => (module, symbol),
            None => ("", handler_ref),
        };
        let module_known = !module.is_empty()
            && factories
                .keys()
                .any(|k| k.rsplit_once('.').is_some_and(|(m, _)| m == module));
        if module_known {
            SchedulerError::HandlerClassNotFound(symbol.to_string())
        } else if module.is_empty() {
            SchedulerError::HandlerModuleNotFound(handler_ref.to_string())
        } else {
            SchedulerError::HandlerModuleNotFound(module.to_string())
        }
    }
}
