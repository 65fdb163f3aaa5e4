//! Routing: choosing the next stage once a stage succeeds.
//!
//! Rules for a stage are evaluated in declaration order and the first match
//! wins. With no match the stage's default route applies, and without one the
//! run is terminal. Evaluation is read-only over the `StateDocument`, so asking
//! twice with the same state gives the same answer.

use crate::engine::StateDocument;
use crate::errors::{RouterPredicateError, panic_message};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Code-defined routing predicate.
pub type Predicate =
    Arc<dyn Fn(&StateDocument) -> Result<bool, RouterPredicateError> + Send + Sync>;

/// What the engine should do after a stage succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "stage", rename_all = "snake_case")]
pub enum RoutingDecision {
    Continue(String),
    Terminal,
}

/// Declarative routing condition, usable from configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Always,
    /// The named stage has recorded an output
    OutputExists { stage: String },
    /// The value at `pointer` inside the stage's output equals `equals`
    OutputEquals {
        stage: String,
        pointer: String,
        equals: Value,
    },
    /// The value at `pointer` inside the run input equals `equals`
    InputEquals { pointer: String, equals: Value },
    /// At least one error was recorded, optionally only against `stage`
    HasErrors {
        #[serde(default)]
        stage: Option<String>,
    },
}

impl Condition {
    pub fn evaluate(&self, state: &StateDocument) -> Result<bool, RouterPredicateError> {
        match self {
            Condition::Always => Ok(true),
            Condition::OutputExists { stage } => Ok(state.latest_output(stage).is_some()),
            Condition::OutputEquals {
                stage,
                pointer,
                equals,
            } => {
                let output = state.latest_output(stage).ok_or_else(|| {
                    RouterPredicateError::new(format!("stage '{}' has no output", stage))
                })?;
                Ok(output.pointer(pointer) == Some(equals))
            }
            Condition::InputEquals { pointer, equals } => {
                Ok(state.input().pointer(pointer) == Some(equals))
            }
            Condition::HasErrors { stage } => Ok(match stage {
                Some(stage) => state.errors().iter().any(|e| &e.stage == stage),
                None => !state.errors().is_empty(),
            }),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Always => write!(f, "always"),
            Condition::OutputExists { stage } => write!(f, "output({}) exists", stage),
            Condition::OutputEquals {
                stage,
                pointer,
                equals,
            } => write!(f, "output({}){} == {}", stage, pointer, equals),
            Condition::InputEquals { pointer, equals } => {
                write!(f, "input{} == {}", pointer, equals)
            }
            Condition::HasErrors { stage: Some(stage) } => write!(f, "errors({}) present", stage),
            Condition::HasErrors { stage: None } => write!(f, "errors present"),
        }
    }
}

#[derive(Clone)]
enum RulePredicate {
    Condition(Condition),
    Custom { label: String, predicate: Predicate },
}

/// `{from, predicate, to}`.
#[derive(Clone)]
pub struct RoutingRule {
    pub from: String,
    pub to: String,
    predicate: RulePredicate,
}

impl RoutingRule {
    /// Unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::on(from, to, Condition::Always)
    }

    /// Edge guarded by a declarative condition.
    pub fn on(from: impl Into<String>, to: impl Into<String>, condition: Condition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            predicate: RulePredicate::Condition(condition),
        }
    }

    /// Edge guarded by an infallible closure.
    pub fn when<F>(from: impl Into<String>, to: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StateDocument) -> bool + Send + Sync + 'static,
    {
        Self::try_when(from, to, move |state| Ok(f(state)))
    }

    /// Edge guarded by a closure that may fail; a failure counts as "no match".
    pub fn try_when<F>(from: impl Into<String>, to: impl Into<String>, f: F) -> Self
    where
        F: Fn(&StateDocument) -> Result<bool, RouterPredicateError> + Send + Sync + 'static,
    {
        Self {
            from: from.into(),
            to: to.into(),
            predicate: RulePredicate::Custom {
                label: "custom".to_string(),
                predicate: Arc::new(f),
            },
        }
    }

    /// Human-readable label shown in route tables.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        if let RulePredicate::Custom { label: ref mut l, .. } = self.predicate {
            *l = label.into();
        }
        self
    }

    pub fn is_unconditional(&self) -> bool {
        matches!(self.predicate, RulePredicate::Condition(Condition::Always))
    }

    pub fn describe(&self) -> String {
        match &self.predicate {
            RulePredicate::Condition(c) => c.to_string(),
            RulePredicate::Custom { label, .. } => label.clone(),
        }
    }

    /// Evaluate the predicate, converting a panic into a predicate error.
    fn evaluate(&self, state: &StateDocument) -> Result<bool, RouterPredicateError> {
        let outcome = match &self.predicate {
            RulePredicate::Condition(c) => catch_unwind(AssertUnwindSafe(|| c.evaluate(state))),
            RulePredicate::Custom { predicate, .. } => {
                catch_unwind(AssertUnwindSafe(|| predicate(state)))
            }
        };
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(RouterPredicateError::new(format!(
                "predicate panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        result.map_err(|mut e| {
            e.from = self.from.clone();
            e.to = self.to.clone();
            e
        })
    }
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("when", &self.describe())
            .finish()
    }
}

/// Result of one routing evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteEvaluation {
    pub decision: RoutingDecision,
    /// Predicates that failed during evaluation; never fatal
    pub warnings: Vec<RouterPredicateError>,
}

/// Ordered routing rules plus per-stage default routes.
#[derive(Clone, Default, Debug)]
pub struct Router {
    rules: IndexMap<String, Vec<RoutingRule>>,
    defaults: IndexMap<String, String>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: RoutingRule) {
        self.rules.entry(rule.from.clone()).or_default().push(rule);
    }

    pub fn with_rule(mut self, rule: RoutingRule) -> Self {
        self.add_rule(rule);
        self
    }

    /// Fallback target when no rule for `from` matches.
    pub fn set_default(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.defaults.insert(from.into(), to.into());
    }

    pub fn with_default(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.set_default(from, to);
        self
    }

    pub fn rules_for(&self, from: &str) -> &[RoutingRule] {
        self.rules.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn default_for(&self, from: &str) -> Option<&str> {
        self.defaults.get(from).map(String::as_str)
    }

    /// Pick the stage after `from`.
    pub fn next(&self, from: &str, state: &StateDocument) -> RouteEvaluation {
        let mut warnings = Vec::new();

        for rule in self.rules_for(from) {
            match rule.evaluate(state) {
                Ok(true) => {
                    return RouteEvaluation {
                        decision: RoutingDecision::Continue(rule.to.clone()),
                        warnings,
                    };
                }
                Ok(false) => {}
                Err(e) => warnings.push(e),
            }
        }

        let decision = match self.default_for(from) {
            Some(to) => RoutingDecision::Continue(to.to_string()),
            None => RoutingDecision::Terminal,
        };
        RouteEvaluation { decision, warnings }
    }

    /// Every `(from, to)` edge, rules first then defaults.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        let rule_edges = self
            .rules
            .values()
            .flatten()
            .map(|r| (r.from.as_str(), r.to.as_str()));
        let default_edges = self
            .defaults
            .iter()
            .map(|(from, to)| (from.as_str(), to.as_str()));
        rule_edges.chain(default_edges).collect()
    }

    /// Stages with rules that can never fire because an earlier unconditional
    /// rule for the same stage always matches first.
    pub fn shadowed_rules(&self) -> Vec<(String, String)> {
        let mut shadowed = Vec::new();
        for (from, rules) in &self.rules {
            if let Some(pos) = rules.iter().position(RoutingRule::is_unconditional) {
                for rule in &rules[pos + 1..] {
                    shadowed.push((from.clone(), rule.to.clone()));
                }
            }
        }
        shadowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with(stage: &str, output: Value) -> StateDocument {
        let mut doc = StateDocument::new(json!({"region": "north"}));
        doc.record_output(stage, output).unwrap();
        doc
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let router = Router::new()
            .with_rule(RoutingRule::when("assess", "alert", |_| true))
            .with_rule(RoutingRule::always("assess", "digest"));

        let state = StateDocument::new(json!(null));
        let eval = router.next("assess", &state);
        assert_eq!(eval.decision, RoutingDecision::Continue("alert".into()));
        assert!(eval.warnings.is_empty());
    }

    #[test]
    fn test_falls_back_to_default_then_terminal() {
        let router = Router::new()
            .with_rule(RoutingRule::when("a", "b", |_| false))
            .with_default("a", "c");
        let state = StateDocument::new(json!(null));

        assert_eq!(
            router.next("a", &state).decision,
            RoutingDecision::Continue("c".into())
        );
        assert_eq!(router.next("z", &state).decision, RoutingDecision::Terminal);
    }

    #[test]
    fn test_failing_predicate_is_no_match_with_warning() {
        let router = Router::new()
            .with_rule(RoutingRule::try_when("a", "b", |_| {
                Err(RouterPredicateError::new("missing field"))
            }))
            .with_rule(RoutingRule::always("a", "c"));

        let eval = router.next("a", &StateDocument::new(json!(null)));
        assert_eq!(eval.decision, RoutingDecision::Continue("c".into()));
        assert_eq!(eval.warnings.len(), 1);
        assert_eq!(eval.warnings[0].from, "a");
        assert_eq!(eval.warnings[0].to, "b");
        assert!(eval.warnings[0].message.contains("missing field"));
    }

    #[test]
    fn test_panicking_predicate_is_contained() {
        let router = Router::new().with_rule(RoutingRule::when("a", "b", |_| {
            panic!("predicate exploded")
        }));

        let eval = router.next("a", &StateDocument::new(json!(null)));
        assert_eq!(eval.decision, RoutingDecision::Terminal);
        assert_eq!(eval.warnings.len(), 1);
        assert!(eval.warnings[0].message.contains("predicate exploded"));
    }

    #[test]
    fn test_next_is_deterministic() {
        let router = Router::new()
            .with_rule(RoutingRule::on(
                "assess",
                "alert",
                Condition::OutputEquals {
                    stage: "assess".into(),
                    pointer: "/severity".into(),
                    equals: json!("high"),
                },
            ))
            .with_rule(RoutingRule::always("assess", "digest"));
        let state = state_with("assess", json!({"severity": "high"}));

        let first = router.next("assess", &state);
        let second = router.next("assess", &state);
        assert_eq!(first, second);
        assert_eq!(first.decision, RoutingDecision::Continue("alert".into()));
    }

    #[test]
    fn test_conditions() {
        let mut state = state_with("assess", json!({"severity": "low"}));
        assert!(Condition::Always.evaluate(&state).unwrap());
        assert!(
            Condition::OutputExists {
                stage: "assess".into()
            }
            .evaluate(&state)
            .unwrap()
        );
        assert!(
            !Condition::OutputEquals {
                stage: "assess".into(),
                pointer: "/severity".into(),
                equals: json!("high"),
            }
            .evaluate(&state)
            .unwrap()
        );
        assert!(
            Condition::OutputEquals {
                stage: "missing".into(),
                pointer: "/x".into(),
                equals: json!(1),
            }
            .evaluate(&state)
            .is_err()
        );
        assert!(
            Condition::InputEquals {
                pointer: "/region".into(),
                equals: json!("north"),
            }
            .evaluate(&state)
            .unwrap()
        );

        let has_errors = Condition::HasErrors { stage: None };
        assert!(!has_errors.evaluate(&state).unwrap());
        state.push_error(crate::engine::ErrorRecord::new("assess", 1, "flaky"));
        assert!(has_errors.evaluate(&state).unwrap());
        assert!(
            !Condition::HasErrors {
                stage: Some("other".into())
            }
            .evaluate(&state)
            .unwrap()
        );
    }

    #[test]
    fn test_output_conditions_see_latest_visit() {
        let mut state = state_with("poll", json!({"ready": false}));
        state.record_visit_output("poll", json!({"ready": true})).unwrap();

        let not_ready = Condition::OutputEquals {
            stage: "poll".into(),
            pointer: "/ready".into(),
            equals: json!(false),
        };
        assert!(!not_ready.evaluate(&state).unwrap());

        let router = Router::new()
            .with_rule(RoutingRule::on("poll", "poll", not_ready))
            .with_default("poll", "publish");
        assert_eq!(
            router.next("poll", &state).decision,
            RoutingDecision::Continue("publish".into())
        );
    }

    #[test]
    fn test_condition_deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            when: Condition,
        }
        let w: Wrapper = toml::from_str(
            r#"when = { kind = "output_equals", stage = "assess", pointer = "/severity", equals = "high" }"#,
        )
        .unwrap();
        assert_eq!(
            w.when,
            Condition::OutputEquals {
                stage: "assess".into(),
                pointer: "/severity".into(),
                equals: json!("high"),
            }
        );
    }

    #[test]
    fn test_edges_and_shadowed_rules() {
        let router = Router::new()
            .with_rule(RoutingRule::always("a", "b"))
            .with_rule(RoutingRule::when("a", "c", |_| true).with_label("never reached"))
            .with_default("b", "d");

        assert_eq!(router.edges(), vec![("a", "b"), ("a", "c"), ("b", "d")]);
        assert_eq!(
            router.shadowed_rules(),
            vec![("a".to_string(), "c".to_string())]
        );
        assert_eq!(router.rules_for("a")[1].describe(), "never reached");
    }
}
