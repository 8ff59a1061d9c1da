//! Module locator
//!
//! Resolves a target selector against the module graph. Regex selectors must
//! match the entire path (the pattern is anchored on both ends before
//! compiling); suffix selectors match whole dotted-path tokens, so `q_proj`
//! matches `layer.0.q_proj` but not `layer.0.k_proj_aux`. Results follow
//! graph traversal order and no match is a valid, empty outcome.

use super::config::TargetSpec;
use super::error::TunerError;
use crate::graph::ModuleGraph;
use regex::Regex;

/// Paths of all modules matched by the selector, in traversal order
pub fn find_target_modules(
    graph: &ModuleGraph,
    spec: &TargetSpec,
) -> Result<Vec<String>, TunerError> {
    match spec {
        TargetSpec::Regex(pattern) => {
            let re = Regex::new(&format!("^(?:{pattern})$"))?;
            Ok(graph
                .iter()
                .filter(|(path, _)| re.is_match(path))
                .map(|(path, _)| path.to_string())
                .collect())
        }
        TargetSpec::Suffixes(suffixes) => Ok(graph
            .iter()
            .filter(|(path, _)| suffixes.iter().any(|s| suffix_matches(path, s)))
            .map(|(path, _)| path.to_string())
            .collect()),
    }
}

/// Exact-token suffix match on dotted-path boundaries
fn suffix_matches(path: &str, suffix: &str) -> bool {
    path == suffix
        || (path.len() > suffix.len()
            && path.ends_with(suffix)
            && path.as_bytes()[path.len() - suffix.len() - 1] == b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ModuleNode;
    use crate::tensor::Tensor;

    fn graph() -> ModuleGraph {
        let mut g = ModuleGraph::new();
        for path in [
            "encoder.layer.0.q_proj",
            "encoder.layer.0.k_proj_aux",
            "encoder.layer.1.q_proj",
            "encoder.layer.1.v_proj",
            "head",
        ] {
            g.insert(
                path,
                ModuleNode::linear(2, 2, Tensor::from_vec(vec![0.0; 4], false), None),
            );
        }
        g
    }

    #[test]
    fn suffix_match_is_exact_token() {
        let g = graph();
        let spec = TargetSpec::Suffixes(vec!["q_proj".into()]);
        let found = find_target_modules(&g, &spec).unwrap();
        assert_eq!(found, vec!["encoder.layer.0.q_proj", "encoder.layer.1.q_proj"]);
    }

    #[test]
    fn substring_suffix_does_not_match() {
        let g = graph();
        let spec = TargetSpec::Suffixes(vec!["k_proj".into()]);
        let found = find_target_modules(&g, &spec).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn whole_path_as_suffix_matches() {
        let g = graph();
        let spec = TargetSpec::Suffixes(vec!["head".into()]);
        let found = find_target_modules(&g, &spec).unwrap();
        assert_eq!(found, vec!["head"]);
    }

    #[test]
    fn regex_must_match_entire_path() {
        let g = graph();
        let spec = TargetSpec::Regex("q_proj".into());
        assert!(find_target_modules(&g, &spec).unwrap().is_empty());

        let spec = TargetSpec::Regex(r"encoder\.layer\.\d+\.q_proj".into());
        let found = find_target_modules(&g, &spec).unwrap();
        assert_eq!(found, vec!["encoder.layer.0.q_proj", "encoder.layer.1.q_proj"]);
    }

    #[test]
    fn regex_alternation_stays_anchored() {
        let g = graph();
        // Without the non-capturing wrapper this alternation would let
        // either arm match unanchored on one side
        let spec = TargetSpec::Regex(r"head|encoder\.layer\.1\.v_proj".into());
        let found = find_target_modules(&g, &spec).unwrap();
        assert_eq!(found, vec!["encoder.layer.1.v_proj", "head"]);
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let g = graph();
        let spec = TargetSpec::Regex("(".into());
        assert!(find_target_modules(&g, &spec).is_err());
    }

    #[test]
    fn no_match_is_empty_not_error() {
        let g = graph();
        let spec = TargetSpec::Suffixes(vec!["o_proj".into()]);
        assert_eq!(find_target_modules(&g, &spec).unwrap(), Vec::<String>::new());
    }

    #[test]
    fn duplicate_suffixes_match_once() {
        let g = graph();
        let spec = TargetSpec::Suffixes(vec!["q_proj".into(), "q_proj".into()]);
        let found = find_target_modules(&g, &spec).unwrap();
        assert_eq!(found.len(), 2);
    }
}
