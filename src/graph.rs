//! Static graph validation.
//!
//! Checks the referential integrity of the frozen topology: every successor
//! edge, map target, switch route and switch default must point at a
//! registered step. Validation failures name the dangling reference.
//! Invoked on demand through `Pipe::validate`, and on every run when
//! `validate_on_run` is enabled.

use indexmap::IndexMap;

use crate::error::PipeError;
use crate::pipe::StepSettings;

pub(crate) fn validate_graph<S, C>(
    settings: &IndexMap<String, StepSettings<S, C>>,
    topology: &IndexMap<String, Vec<String>>,
) -> Result<(), PipeError> {
    let registered = |name: &str| settings.contains_key(name);

    for (name, successors) in topology {
        if !registered(name) {
            return Err(PipeError::validation(format!(
                "Topology references unregistered step '{name}'"
            )));
        }
        for succ in successors {
            if !registered(succ) {
                return Err(PipeError::validation(format!(
                    "Step '{name}' routes to unregistered step '{succ}'"
                )));
            }
        }
    }

    for (name, cfg) in settings {
        if let Some(target) = &cfg.map_target {
            if !registered(target) {
                return Err(PipeError::validation(format!(
                    "Map step '{name}' uses unregistered step '{target}'"
                )));
            }
        }
        if let Some(routes) = &cfg.switch_routes {
            for target in routes.static_targets() {
                if !registered(&target) {
                    return Err(PipeError::validation(format!(
                        "Switch step '{name}' routes to unregistered step '{target}'"
                    )));
                }
            }
        }
        if let Some(default) = &cfg.switch_default {
            if !registered(default) {
                return Err(PipeError::validation(format!(
                    "Switch step '{name}' defaults to unregistered step '{default}'"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RouteTarget, Routes, StepKind};

    fn settings_with(names: &[(&str, StepKind)]) -> IndexMap<String, StepSettings<(), ()>> {
        names
            .iter()
            .map(|(n, k)| (n.to_string(), StepSettings::of(*k)))
            .collect()
    }

    fn topology(edges: &[(&str, &str)]) -> IndexMap<String, Vec<String>> {
        edges
            .iter()
            .map(|(from, to)| (from.to_string(), vec![to.to_string()]))
            .collect()
    }

    #[test]
    fn test_valid_graph_passes() {
        let settings = settings_with(&[("a", StepKind::Step), ("b", StepKind::Step)]);
        let topo = topology(&[("a", "b")]);
        assert!(validate_graph(&settings, &topo).is_ok());
    }

    #[test]
    fn test_dangling_successor_named() {
        let settings = settings_with(&[("a", StepKind::Step)]);
        let topo = topology(&[("a", "ghost")]);
        let err = validate_graph(&settings, &topo).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_unregistered_topology_key() {
        let settings = settings_with(&[("a", StepKind::Step)]);
        let topo = topology(&[("phantom", "a")]);
        let err = validate_graph(&settings, &topo).unwrap_err();
        assert!(err.to_string().contains("phantom"));
    }

    #[test]
    fn test_dangling_map_target() {
        let mut settings = settings_with(&[("fan", StepKind::Map)]);
        settings.get_mut("fan").unwrap().map_target = Some("worker".to_string());
        let err = validate_graph(&settings, &IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("worker"));
    }

    #[test]
    fn test_dangling_switch_route_and_default() {
        let mut settings = settings_with(&[("route", StepKind::Switch), ("ok", StepKind::Step)]);
        settings.get_mut("route").unwrap().switch_routes = Some(Routes::table([
            ("x", RouteTarget::step("ok")),
            ("y", RouteTarget::step("nowhere")),
        ]));
        let err = validate_graph(&settings, &IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        let mut settings = settings_with(&[("route", StepKind::Switch)]);
        settings.get_mut("route").unwrap().switch_default = Some("fallback".to_string());
        let err = validate_graph(&settings, &IndexMap::new()).unwrap_err();
        assert!(err.to_string().contains("fallback"));
    }

    #[test]
    fn test_dynamic_routes_are_unverifiable() {
        let mut settings = settings_with(&[("route", StepKind::Switch)]);
        settings.get_mut("route").unwrap().switch_routes =
            Some(Routes::dynamic(|_| Some(RouteTarget::step("anywhere"))));
        assert!(validate_graph(&settings, &IndexMap::new()).is_ok());
    }
}
