//! Expression binding seam.
//!
//! The interpreter never parses expressions itself. A document declares a
//! data model type; the builder looks the type up in a [`BindingRegistry`]
//! and asks the binding to compile every expression into an evaluator object.
//! Sessions invoke those evaluators with an [`ExecutionContext`].

use crate::error::EvalError;
use crate::event::Event;
use rstchart_value::{DataObject, DataValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Data model used when a document does not declare one.
pub const DEFAULT_DATAMODEL: &str = "simple";

/// What an evaluator can see of the running session.
pub trait ExecutionContext {
    /// Root object of the session's data store.
    fn data(&self) -> &DataObject;

    /// The event being processed, if any.
    fn event(&self) -> Option<&Event>;

    fn session_id(&self) -> &str;

    /// The document name.
    fn name(&self) -> Option<&str>;

    /// True if the state with the given id is in the active configuration.
    fn in_state(&self, id: &str) -> bool;
}

pub trait ValueEvaluator: Send + Sync {
    fn evaluate(&self, ctx: &dyn ExecutionContext) -> Result<DataValue, EvalError>;
}

pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, ctx: &dyn ExecutionContext) -> Result<bool, EvalError>;
}

pub trait LocationEvaluator: Send + Sync {
    fn assign(&self, ctx: &dyn ExecutionContext, value: DataValue) -> Result<(), EvalError>;

    fn read(&self, ctx: &dyn ExecutionContext) -> Result<DataValue, EvalError>;
}

pub trait ScriptEvaluator: Send + Sync {
    fn execute(&self, ctx: &dyn ExecutionContext) -> Result<(), EvalError>;
}

/// A data model implementation.
pub trait ExpressionBinding: Send + Sync {
    fn name(&self) -> &str;

    fn compile_value(&self, source: &str) -> Result<Arc<dyn ValueEvaluator>, EvalError>;

    fn compile_condition(&self, source: &str) -> Result<Arc<dyn ConditionEvaluator>, EvalError>;

    fn compile_location(&self, source: &str) -> Result<Arc<dyn LocationEvaluator>, EvalError>;

    fn compile_script(&self, body: &str) -> Result<Arc<dyn ScriptEvaluator>, EvalError>;

    /// Location written by a `<data id="...">` declaration.
    fn data_location(&self, id: &str) -> Result<Arc<dyn LocationEvaluator>, EvalError>;

    /// Key under which a `namelist` location is sent.
    fn location_name(&self, source: &str) -> String {
        source.trim().to_string()
    }
}

macro_rules! compiled {
    ($name:ident, $eval:ident) => {
        /// A compiled expression together with its source text.
        #[derive(Clone)]
        pub struct $name {
            pub source: String,
            pub eval: Arc<dyn $eval>,
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), self.source)
            }
        }
    };
}

compiled!(ValueExpr, ValueEvaluator);
compiled!(CondExpr, ConditionEvaluator);
compiled!(LocationExpr, LocationEvaluator);
compiled!(ScriptExpr, ScriptEvaluator);

/// Data model types available to the builder.
#[derive(Clone)]
pub struct BindingRegistry {
    bindings: HashMap<String, Arc<dyn ExpressionBinding>>,
}

impl BindingRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Registers a binding under its own name, replacing any previous one.
    pub fn register(&mut self, binding: Arc<dyn ExpressionBinding>) {
        self.bindings.insert(binding.name().to_string(), binding);
    }

    pub fn with(mut self, binding: Arc<dyn ExpressionBinding>) -> Self {
        self.register(binding);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ExpressionBinding>> {
        self.bindings.get(name).cloned()
    }
}

impl Default for BindingRegistry {
    /// Registry with the built-in `null` and `simple` bindings.
    fn default() -> Self {
        Self::empty()
            .with(Arc::new(NullBinding))
            .with(Arc::new(crate::simple::SimpleBinding))
    }
}

/// The `null` data model: no data, only `In('state')` conditions.
#[derive(Debug, Default)]
pub struct NullBinding;

struct InStateCondition(String);

impl ConditionEvaluator for InStateCondition {
    fn evaluate(&self, ctx: &dyn ExecutionContext) -> Result<bool, EvalError> {
        Ok(ctx.in_state(&self.0))
    }
}

impl NullBinding {
    fn unsupported<T>(what: &str) -> Result<T, EvalError> {
        Err(EvalError::Unsupported {
            binding: "null".to_string(),
            what: what.to_string(),
        })
    }
}

impl ExpressionBinding for NullBinding {
    fn name(&self) -> &str {
        "null"
    }

    fn compile_value(&self, _source: &str) -> Result<Arc<dyn ValueEvaluator>, EvalError> {
        Self::unsupported("value expressions")
    }

    fn compile_condition(&self, source: &str) -> Result<Arc<dyn ConditionEvaluator>, EvalError> {
        let trimmed = source.trim();
        let inner = trimmed
            .strip_prefix("In(")
            .and_then(|s| s.strip_suffix(')'))
            .map(|s| s.trim().trim_matches(|c| c == '\'' || c == '"'))
            .filter(|s| !s.is_empty());
        match inner {
            Some(id) => Ok(Arc::new(InStateCondition(id.to_string()))),
            None => Err(EvalError::Syntax {
                source_text: source.to_string(),
                reason: "only In('state') is supported".to_string(),
            }),
        }
    }

    fn compile_location(&self, _source: &str) -> Result<Arc<dyn LocationEvaluator>, EvalError> {
        Self::unsupported("locations")
    }

    fn compile_script(&self, _body: &str) -> Result<Arc<dyn ScriptEvaluator>, EvalError> {
        Self::unsupported("scripts")
    }

    fn data_location(&self, _id: &str) -> Result<Arc<dyn LocationEvaluator>, EvalError> {
        Self::unsupported("data declarations")
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestContext;
    use super::*;

    #[test]
    fn test_null_binding_in_condition() {
        let binding = NullBinding;
        let cond = binding.compile_condition("In('busy')").unwrap();
        let mut ctx = TestContext::new(DataValue::object());

        assert!(!cond.evaluate(&ctx).unwrap());
        ctx.active.push("busy".to_string());
        assert!(cond.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_null_binding_rejects_values() {
        let binding = NullBinding;
        assert!(binding.compile_value("1").is_err());
        assert!(binding.compile_condition("ctx.a").is_err());
    }

    #[test]
    fn test_default_registry_has_builtins() {
        let registry = BindingRegistry::default();
        assert!(registry.get("null").is_some());
        assert!(registry.get(DEFAULT_DATAMODEL).is_some());
        assert!(registry.get("ecmascript").is_none());
    }
}
