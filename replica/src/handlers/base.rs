use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::bail;
use crate::error::{ErrorKind, ReplicaResult};
use crate::handlers::{ColumnMapperHandler, DefaultHandler};
use crate::state::table::TableState;
use crate::types::{BatchInfo, Event, RowChange};

/// Capability set of a per table handler.
///
/// The dispatcher calls [`TableHandler::prepare_batch`] once per batch before the first
/// event of the table, [`TableHandler::finish_batch`] once after the last one and
/// [`TableHandler::reset`] right after finishing.
pub trait TableHandler: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn prepare_batch(&mut self, batch: &BatchInfo) -> ReplicaResult<()>;

    /// Shapes one row event, emitting zero or more changes.
    fn process_event(&mut self, event: &Event, emit: &mut dyn FnMut(RowChange)) -> ReplicaResult<()>;

    fn finish_batch(&mut self, batch: &BatchInfo) -> ReplicaResult<()>;

    /// Forgets per batch state.
    fn reset(&mut self);

    /// Returns `true` if truncate events of the table must not be applied.
    fn ignore_truncate(&self) -> bool {
        false
    }

    /// Filter applied to the bulk copy of the table.
    fn copy_condition(&self) -> Option<&str> {
        None
    }
}

/// What a handler is built from.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub table: String,
    pub dest_table: String,
    pub args: BTreeMap<String, String>,
}

impl HandlerConfig {
    pub fn for_table(state: &TableState) -> Self {
        Self {
            table: state.name.clone(),
            dest_table: state.dest_table.clone(),
            args: state.handler.args.clone(),
        }
    }

    /// Returns `true` for flag arguments set to `1`, `true` or `yes`, or given without a value.
    pub fn flag(&self, key: &str) -> bool {
        self.args
            .get(key)
            .is_some_and(|value| matches!(value.as_str(), "" | "1" | "true" | "yes"))
    }
}

pub type HandlerFactory = fn(HandlerConfig) -> ReplicaResult<Box<dyn TableHandler>>;

/// Registry resolving handler names to factories.
#[derive(Clone)]
pub struct HandlerRegistry {
    factories: HashMap<&'static str, HandlerFactory>,
}

impl HandlerRegistry {
    pub const DEFAULT_HANDLER: &'static str = "default";

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, factory: HandlerFactory) {
        self.factories.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Builds the handler configured for `state`.
    pub fn create(&self, state: &TableState) -> ReplicaResult<Box<dyn TableHandler>> {
        let name = state
            .handler
            .name
            .as_deref()
            .unwrap_or(Self::DEFAULT_HANDLER);

        let Some(factory) = self.factories.get(name) else {
            bail!(
                ErrorKind::UnknownHandler,
                "No handler registered with this name",
                format!("{name} (table {})", state.name)
            );
        };

        factory(HandlerConfig::for_table(state))
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(DefaultHandler::NAME, |config| {
            Ok(Box::new(DefaultHandler::new(config)))
        });
        registry.register(ColumnMapperHandler::NAME, |config| {
            Ok(Box::new(ColumnMapperHandler::new(config)?))
        });

        registry
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();

        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}
