//! Signature analysis: maps declared step parameters to injection sources.
//!
//! A step declares its parameters at registration time; each one is resolved
//! to a source once, and the invoker materializes the resulting keyword map
//! on every call. Resolution order:
//!
//! 1. by declared type, when the type is exactly the pipeline's state or
//!    context type and that type is not the open `serde_json::Value`;
//! 2. by name, against the alias tables below;
//! 3. parameters with a default value and no match are ignored;
//! 4. anything left is an "unknown", the per-item slot of a map companion.
//!
//! Registration fails when a step declares more unknowns than its kind
//! allows.

use std::any::TypeId;

use serde_json::Value;

use crate::error::PipeError;

/// Parameter names resolved to the state handle.
pub const STATE_ALIASES: &[&str] = &["s", "state"];
/// Parameter names resolved to the context handle.
pub const CONTEXT_ALIASES: &[&str] = &["c", "ctx", "context"];
/// Parameter names resolved to the triggering error.
pub const ERROR_ALIASES: &[&str] = &["e", "error", "exception"];
/// Parameter names resolved to the current step name.
pub const STEP_NAME_ALIASES: &[&str] = &["step_name", "stage"];

/// Where a parameter's value comes from at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    State,
    Context,
    Error,
    StepName,
    /// Unrecognized: filled from the invocation payload (map item slot).
    Unknown,
}

/// One declared parameter.
#[derive(Debug, Clone)]
pub struct Param {
    name: String,
    type_hint: Option<TypeId>,
    has_default: bool,
}

impl Param {
    /// An untyped parameter, resolved by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: None,
            has_default: false,
        }
    }

    /// A parameter annotated with a concrete type.
    pub fn typed<T: 'static>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_hint: Some(TypeId::of::<T>()),
            has_default: false,
        }
    }

    /// A parameter with a default value: ignored when nothing matches.
    pub fn with_default(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            has_default: true,
            type_hint: None,
        }
    }
}

/// Ordered parameter list of one callable.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    params: Vec<Param>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn arg(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Shorthand for a list of untyped parameters.
    pub fn of(names: &[&str]) -> Self {
        Self {
            params: names.iter().map(|name| Param::new(*name)).collect(),
        }
    }
}

/// The resolved parameter → source table, in declaration order.
pub type InjectionMap = Vec<(String, ParamSource)>;

/// Name of the first unknown parameter, the payload key of a map companion.
pub(crate) fn first_unknown(map: &InjectionMap) -> Option<&str> {
    map.iter()
        .find(|(_, src)| *src == ParamSource::Unknown)
        .map(|(name, _)| name.as_str())
}

/// Resolve each parameter of `sig` to a source.
///
/// `S` and `C` are the pipeline's declared state and context types;
/// `serde_json::Value` is treated as the open/wildcard type and never
/// matches by annotation.
pub fn analyze_signature<S: 'static, C: 'static>(
    step_name: &str,
    sig: &Signature,
    expected_unknowns: usize,
) -> Result<InjectionMap, PipeError> {
    let state_type = TypeId::of::<S>();
    let context_type = TypeId::of::<C>();
    let wildcard = TypeId::of::<Value>();

    let mut mapping: InjectionMap = Vec::new();
    let mut unknowns: Vec<String> = Vec::new();

    for param in &sig.params {
        let source = if param.type_hint == Some(state_type) && state_type != wildcard {
            ParamSource::State
        } else if param.type_hint == Some(context_type) && context_type != wildcard {
            ParamSource::Context
        } else if STATE_ALIASES.contains(&param.name.as_str()) {
            ParamSource::State
        } else if CONTEXT_ALIASES.contains(&param.name.as_str()) {
            ParamSource::Context
        } else if ERROR_ALIASES.contains(&param.name.as_str()) {
            ParamSource::Error
        } else if STEP_NAME_ALIASES.contains(&param.name.as_str()) {
            ParamSource::StepName
        } else if param.has_default {
            continue;
        } else {
            unknowns.push(param.name.clone());
            ParamSource::Unknown
        };
        mapping.push((param.name.clone(), source));
    }

    if unknowns.len() > expected_unknowns {
        return Err(PipeError::validation(format!(
            "Step '{}' has {} unrecognized parameters: {:?}. Expected {} unknown parameter(s) \
             for this step type. Parameters must be typed as the pipeline's state or context \
             type, or named 'state'/'context'/'error'/'step_name'.",
            step_name,
            unknowns.len(),
            unknowns,
            expected_unknowns,
        )));
    }

    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct AppState;
    #[derive(Debug)]
    struct AppContext;

    #[test]
    fn test_name_aliases() {
        let sig = Signature::of(&["s", "ctx", "error", "stage"]);
        let map = analyze_signature::<AppState, AppContext>("step", &sig, 0).unwrap();
        assert_eq!(
            map,
            vec![
                ("s".to_string(), ParamSource::State),
                ("ctx".to_string(), ParamSource::Context),
                ("error".to_string(), ParamSource::Error),
                ("stage".to_string(), ParamSource::StepName),
            ]
        );
    }

    #[test]
    fn test_type_hint_beats_name() {
        // A parameter named like a context alias but typed as the state type
        // resolves to state.
        let sig = Signature::new().arg(Param::typed::<AppState>("ctx"));
        let map = analyze_signature::<AppState, AppContext>("step", &sig, 0).unwrap();
        assert_eq!(map, vec![("ctx".to_string(), ParamSource::State)]);
    }

    #[test]
    fn test_wildcard_type_never_matches_by_annotation() {
        // With Value as the state type, annotation matching is disabled and
        // the name fallback applies.
        let sig = Signature::new().arg(Param::typed::<Value>("payload_item"));
        let map = analyze_signature::<Value, AppContext>("step", &sig, 1).unwrap();
        assert_eq!(map, vec![("payload_item".to_string(), ParamSource::Unknown)]);
    }

    #[test]
    fn test_defaulted_params_are_ignored() {
        let sig = Signature::new()
            .arg(Param::new("state"))
            .arg(Param::with_default("verbose"));
        let map = analyze_signature::<AppState, AppContext>("step", &sig, 0).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map[0].0, "state");
    }

    #[test]
    fn test_unknown_within_allowance() {
        let sig = Signature::of(&["state", "row"]);
        let map = analyze_signature::<AppState, AppContext>("worker", &sig, 1).unwrap();
        assert_eq!(first_unknown(&map), Some("row"));
    }

    #[test]
    fn test_too_many_unknowns_fails() {
        let sig = Signature::of(&["row", "extra"]);
        let err = analyze_signature::<AppState, AppContext>("worker", &sig, 1).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("worker"));
        assert!(msg.contains("2 unrecognized parameters"));
        assert!(msg.contains("Expected 1"));
    }
}
