//! Typed component registries.
//!
//! A `Namespace` maps configured `type` names to constructors for one kind of
//! component. `initialize` resolves a `{type, args}` config section against a
//! namespace and builds the component with merged keyword arguments.

use crate::error::{TrainingError, TrainingResult};
use mosaic_abstraction::{ComponentArgs, ComponentError, ComponentResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Builds a component from its positional context and merged arguments.
pub type Constructor<T, C> = Box<dyn Fn(C, &ComponentArgs) -> ComponentResult<T> + Send + Sync>;

/// Registry of constructors for one component kind.
pub struct Namespace<T, C = ()> {
    kind: &'static str,
    constructors: BTreeMap<String, Constructor<T, C>>,
}

impl<T, C> fmt::Debug for Namespace<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

impl<T, C> Namespace<T, C> {
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        Self { kind, constructors: BTreeMap::new() }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Registers a constructor under `name`.
    ///
    /// # Errors
    /// `DuplicateRegistration` if `name` is already taken.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> TrainingResult<()>
    where
        F: Fn(C, &ComponentArgs) -> ComponentResult<T> + Send + Sync + 'static,
    {
        if self.constructors.contains_key(name) {
            return Err(TrainingError::DuplicateRegistration { kind: self.kind.to_string(), name: name.to_string() });
        }
        debug!(kind = self.kind, name, "Registering component");
        self.constructors.insert(name.to_string(), Box::new(constructor));
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with<F>(mut self, name: &str, constructor: F) -> TrainingResult<Self>
    where
        F: Fn(C, &ComponentArgs) -> ComponentResult<T> + Send + Sync + 'static,
    {
        self.register(name, constructor)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.constructors.keys().cloned().collect()
    }

    /// Fails with `UnknownComponentType` unless `type_name` is registered.
    pub fn check(&self, section: &str, type_name: &str) -> TrainingResult<()> {
        if self.contains(type_name) {
            Ok(())
        } else {
            Err(TrainingError::UnknownComponentType {
                section: section.to_string(),
                type_name: type_name.to_string(),
                available: self.names(),
            })
        }
    }

    /// Runs the constructor registered under `type_name`.
    pub fn construct(&self, section: &str, type_name: &str, ctx: C, args: &ComponentArgs) -> TrainingResult<T> {
        self.check(section, type_name)?;
        let constructor = &self.constructors[type_name];
        constructor(ctx, args).map_err(|e| match e {
            ComponentError::InvalidArguments(reason) => TrainingError::InvalidArgs {
                section: section.to_string(),
                type_name: type_name.to_string(),
                reason,
            },
            other => TrainingError::component(format!("{section} '{type_name}'"), other),
        })
    }
}

/// A resolved `{type, args}` section.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub type_name: String,
    pub args: ComponentArgs,
}

impl ComponentSpec {
    /// Reads `type` (required string) and `args` (optional mapping).
    pub fn from_section(section: &str, value: &Value) -> TrainingResult<Self> {
        let Some(obj) = value.as_object() else {
            return Err(TrainingError::InvalidConfig(format!("'{section}' must be a {{type, args}} mapping")));
        };
        let type_name = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TrainingError::InvalidConfig(format!("'{section}.type' must be a string")))?
            .to_string();
        let args = match obj.get("args") {
            None | Some(Value::Null) => ComponentArgs::new(),
            Some(Value::Object(args)) => args.clone(),
            Some(other) => {
                return Err(TrainingError::InvalidConfig(format!("'{section}.args' must be a mapping, got {other}")));
            }
        };
        Ok(Self { type_name, args })
    }
}

/// How caller-supplied arguments combine with configured ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverridePolicy {
    /// A key present in both with a different value is a `ConfigConflict`.
    #[default]
    Reject,
    /// The caller's value wins; the override is logged.
    PreferCallSite,
}

/// Merges `extra` into `base`.
pub fn merge_args(
    section: &str,
    base: &ComponentArgs,
    extra: &ComponentArgs,
    policy: OverridePolicy,
) -> TrainingResult<ComponentArgs> {
    let mut merged = base.clone();
    for (key, value) in extra {
        match merged.get(key) {
            Some(existing) if existing != value => match policy {
                OverridePolicy::Reject => {
                    return Err(TrainingError::ConfigConflict { section: section.to_string(), key: key.clone() });
                }
                OverridePolicy::PreferCallSite => {
                    warn!(section, key = %key, configured = %existing, applied = %value, "Overriding configured argument");
                }
            },
            _ => {}
        }
        merged.insert(key.clone(), value.clone());
    }
    Ok(merged)
}

/// Builds the component configured under `config[key]`.
///
/// # Errors
/// `MissingConfigSection` if `key` is absent, `UnknownComponentType` if its
/// `type` is not registered, `ConfigConflict` on conflicting arguments.
pub fn initialize<T, C>(
    config: &Value,
    key: &str,
    namespace: &Namespace<T, C>,
    ctx: C,
    extra: &ComponentArgs,
    policy: OverridePolicy,
) -> TrainingResult<T> {
    let section = config.get(key).ok_or_else(|| TrainingError::MissingConfigSection { section: key.to_string() })?;
    let spec = ComponentSpec::from_section(key, section)?;
    namespace.check(key, &spec.type_name)?;
    let args = merge_args(key, &spec.args, extra, policy)?;
    debug!(section = key, type_name = %spec.type_name, "Initializing component");
    namespace.construct(key, &spec.type_name, ctx, &args)
}
