//! Routing decision for a task: sub-flow marker, registry prefix, or manual.
//!
//! Pure string logic; the engine owns the registry and the atom catalog.
//! Regexes are compiled once into statics on the linear-time engine, so
//! hostile task names cannot blow the matching budget.

use std::sync::LazyLock;

use regex::Regex;

/// Where a task should be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Inline `<!-- type: flow -->` marker: descend into the sub-flow engine.
    SubFlow,
    /// Registry hit for the given atom key.
    Atom(String),
    /// Nothing matched: manual intervention.
    Manual,
}

/// Zero-width characters stripped before any matching, so invisible
/// characters cannot smuggle a task past (or into) the registry.
const ZERO_WIDTH: [char; 4] = ['\u{200b}', '\u{200c}', '\u{200d}', '\u{feff}'];

static FLOW_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)<!-- type: flow -->($|\s)").expect("static regex"));

static ATOM_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([A-Za-z0-9_]+)\]").expect("static regex"));

/// Decide the route for a task name.
///
/// Precedence: inline flow marker (outside code spans) > registry prefix >
/// manual fallback. Registry matching is case-sensitive by policy.
pub fn route(task_name: &str, is_registered: impl Fn(&str) -> bool) -> Route {
    let cleaned: String = task_name
        .chars()
        .filter(|c| !ZERO_WIDTH.contains(c))
        .collect();
    let cleaned = cleaned.trim();

    if has_flow_marker(cleaned) {
        return Route::SubFlow;
    }

    if let Some(captures) = ATOM_TAG.captures(cleaned) {
        let key = &captures[1];
        if is_registered(key) {
            return Route::Atom(key.to_string());
        }
        return Route::Manual;
    }

    if let Some(token) = prefix_token(cleaned) {
        if is_registered(token) {
            return Route::Atom(token.to_string());
        }
    }
    Route::Manual
}

/// True when the flow marker appears at line level, outside backtick spans.
fn has_flow_marker(name: &str) -> bool {
    for found in FLOW_MARKER.find_iter(name) {
        let backticks_before = name[..found.start()].matches('`').count();
        if backticks_before % 2 == 0 {
            return true;
        }
    }
    false
}

/// The canonical prefix token: text before the first `:` or whitespace.
fn prefix_token(name: &str) -> Option<&str> {
    let token = name.split([':', ' ', '\t']).next()?;
    if token.is_empty() {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry<'a>(keys: &'a [&'a str]) -> impl Fn(&str) -> bool + 'a {
        move |key| keys.contains(&key)
    }

    #[test]
    fn flow_marker_routes_to_subflow() {
        let route = route("Phase 1 <!-- type: flow -->", registry(&[]));
        assert_eq!(route, Route::SubFlow);
    }

    #[test]
    fn flow_marker_beats_registry_prefix() {
        let r = route("[Deploy] roll out <!-- type: flow -->", registry(&["Deploy"]));
        assert_eq!(r, Route::SubFlow);
    }

    #[test]
    fn marker_inside_backticks_is_ignored() {
        let r = route("Document `<!-- type: flow -->` syntax", registry(&[]));
        assert_eq!(r, Route::Manual);
    }

    #[test]
    fn bracket_tag_matches_registry() {
        let r = route("[Deploy] push the release", registry(&["Deploy"]));
        assert_eq!(r, Route::Atom("Deploy".to_string()));
    }

    #[test]
    fn registry_matching_is_case_sensitive() {
        let r = route("[deploy] push the release", registry(&["Deploy"]));
        assert_eq!(r, Route::Manual);
    }

    #[test]
    fn zero_width_characters_are_stripped_before_lookup() {
        let r = route("[De\u{200b}ploy] push", registry(&["Deploy"]));
        assert_eq!(r, Route::Atom("Deploy".to_string()));
    }

    #[test]
    fn prefix_token_before_colon_matches() {
        let r = route("Deploy: push the release", registry(&["Deploy"]));
        assert_eq!(r, Route::Atom("Deploy".to_string()));
    }

    #[test]
    fn unknown_prefix_falls_back_to_manual() {
        let r = route("Refactor the parser", registry(&["Deploy"]));
        assert_eq!(r, Route::Manual);
    }

    #[test]
    fn bracket_tag_not_in_registry_is_manual() {
        let r = route("[Ghost] do something", registry(&["Deploy"]));
        assert_eq!(r, Route::Manual);
    }
}
