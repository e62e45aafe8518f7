//! Rule evaluation engine
//!
//! An [`Evaluator`] is scoped to one immutable [`RuleSet`] and one request's
//! facts. Evaluation is a bottom-up fixed point: every round applies every
//! rule to the facts known so far until no new fact appears.
//!
//! Derived facts may contain variables when a head variable does not occur
//! in the body. Such facts are universally quantified and stored with their
//! variables renamed to `?0`, `?1`, ... so equivalent facts deduplicate.

use pgc_core::{Atom, RuleSet, Term};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// One satisfying substitution: goal variable name to value
pub type Binding = BTreeMap<String, Term>;

/// Name reported for a goal variable left unconstrained by a derivation
pub const UNBOUND: &str = "_";

/// Bounds that turn runaway evaluation into an inconclusive result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorLimits {
    /// Maximum fixed-point rounds that derive new facts
    pub max_iterations: usize,

    /// Maximum facts held by one evaluator, asserted and derived
    pub max_facts: usize,
}

impl Default for EvaluatorLimits {
    fn default() -> Self {
        Self {
            max_iterations: 64,
            max_facts: 100_000,
        }
    }
}

/// Evaluation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvalError {
    #[error("asserted fact is not ground: {0}")]
    NonGroundFact(String),

    #[error("evaluation inconclusive after {iterations} iterations with {facts} facts")]
    Inconclusive { iterations: usize, facts: usize },
}

/// Answer to a query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Distinct substitutions for the goal's variables, in derivation order
    pub bindings: Vec<Binding>,

    /// Whether the goal is derivable at all
    pub has_result: bool,

    /// Fixed-point rounds run so far
    pub iterations: usize,

    /// Facts derived by rules so far
    pub derived: usize,
}

type Substitution = HashMap<String, Term>;

/// Facts indexed by predicate and arity, in insertion order
#[derive(Debug, Default)]
struct FactStore {
    by_predicate: HashMap<(String, usize), Vec<Atom>>,
    seen: HashSet<Atom>,
}

impl FactStore {
    fn insert(&mut self, atom: Atom) -> bool {
        if !self.seen.insert(atom.clone()) {
            return false;
        }
        self.by_predicate
            .entry((atom.predicate.clone(), atom.arity()))
            .or_default()
            .push(atom);
        true
    }

    fn contains(&self, atom: &Atom) -> bool {
        self.seen.contains(atom)
    }

    fn matching(&self, atom: &Atom) -> &[Atom] {
        self.by_predicate
            .get(&(atom.predicate.clone(), atom.arity()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Request-scoped evaluator over one rule set
#[derive(Debug)]
pub struct Evaluator {
    rule_set: Arc<RuleSet>,
    limits: EvaluatorLimits,
    facts: FactStore,
    saturated: bool,
    iterations: usize,
    derived: usize,
    fresh: usize,
}

impl Evaluator {
    /// Create an evaluator with default limits
    pub fn new(rule_set: Arc<RuleSet>) -> Self {
        Self::with_limits(rule_set, EvaluatorLimits::default())
    }

    /// Create an evaluator with explicit limits
    pub fn with_limits(rule_set: Arc<RuleSet>, limits: EvaluatorLimits) -> Self {
        let mut facts = FactStore::default();
        for clause in rule_set.clauses().iter().filter(|c| c.is_fact()) {
            facts.insert(normalize(&clause.head));
        }

        Self {
            rule_set,
            limits,
            facts,
            saturated: false,
            iterations: 0,
            derived: 0,
            fresh: 0,
        }
    }

    /// Rule set this evaluator is bound to
    pub fn rule_set(&self) -> &Arc<RuleSet> {
        &self.rule_set
    }

    /// Add ground facts
    pub fn assert_facts(&mut self, facts: impl IntoIterator<Item = Atom>) -> Result<(), EvalError> {
        for fact in facts {
            if !fact.is_ground() {
                return Err(EvalError::NonGroundFact(fact.to_string()));
            }
            if self.facts.insert(fact) {
                self.saturated = false;
            }
        }
        Ok(())
    }

    /// Answer `goal` against the rule set and asserted facts
    pub fn query(&mut self, goal: &Atom) -> Result<QueryResult, EvalError> {
        self.saturate()?;

        let variables: Vec<String> = goal.variables().into_iter().map(String::from).collect();
        let mut bindings: Vec<Binding> = Vec::new();

        for fact in self.facts.matching(goal) {
            let fact = rename_apart(fact, &mut self.fresh);
            let Some(subst) = unify_atoms(goal, &fact, Substitution::new()) else {
                continue;
            };

            let binding: Binding = variables
                .iter()
                .map(|var| {
                    let value = match resolve(&Term::var(var.as_str()), &subst) {
                        Term::Var(_) => Term::var(UNBOUND),
                        constant => constant,
                    };
                    (var.clone(), value)
                })
                .collect();

            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }

        Ok(QueryResult {
            has_result: !bindings.is_empty(),
            bindings,
            iterations: self.iterations,
            derived: self.derived,
        })
    }

    fn saturate(&mut self) -> Result<(), EvalError> {
        if self.saturated {
            return Ok(());
        }

        let rule_set = Arc::clone(&self.rule_set);
        let rules: Vec<_> = rule_set.clauses().iter().filter(|c| !c.is_fact()).collect();

        loop {
            self.iterations += 1;

            let mut new_facts: Vec<Atom> = Vec::new();
            let mut pending: HashSet<Atom> = HashSet::new();

            for clause in &rules {
                let mut solutions = Vec::new();
                match_body(&clause.body, &self.facts, Substitution::new(), &mut self.fresh, &mut solutions);

                for subst in solutions {
                    let head = normalize(&substitute(&clause.head, &subst));
                    if !self.facts.contains(&head) && pending.insert(head.clone()) {
                        new_facts.push(head);
                    }
                }
            }

            trace!(
                iteration = self.iterations,
                new_facts = new_facts.len(),
                "Fixed-point round"
            );

            if new_facts.is_empty() {
                break;
            }

            // The round confirming the fixed point is free; only rounds that
            // still derive something count against the cap.
            if self.iterations > self.limits.max_iterations {
                return Err(EvalError::Inconclusive {
                    iterations: self.iterations,
                    facts: self.facts.len(),
                });
            }

            if self.facts.len() + new_facts.len() > self.limits.max_facts {
                return Err(EvalError::Inconclusive {
                    iterations: self.iterations,
                    facts: self.facts.len() + new_facts.len(),
                });
            }

            self.derived += new_facts.len();
            for fact in new_facts {
                self.facts.insert(fact);
            }
        }

        self.saturated = true;
        Ok(())
    }
}

/// Depth-first join of `body` against the fact store
fn match_body(
    body: &[Atom],
    facts: &FactStore,
    subst: Substitution,
    fresh: &mut usize,
    solutions: &mut Vec<Substitution>,
) {
    let Some((first, rest)) = body.split_first() else {
        solutions.push(subst);
        return;
    };

    for fact in facts.matching(first) {
        let fact = rename_apart(fact, fresh);
        if let Some(extended) = unify_atoms(first, &fact, subst.clone()) {
            match_body(rest, facts, extended, fresh, solutions);
        }
    }
}

/// Give a stored fact's variables names no clause can use
fn rename_apart(fact: &Atom, fresh: &mut usize) -> Atom {
    if fact.is_ground() {
        return fact.clone();
    }
    *fresh += 1;
    let suffix = *fresh;
    Atom::new(
        fact.predicate.clone(),
        fact.args
            .iter()
            .map(|t| match t {
                Term::Var(name) => Term::Var(format!("{}#{}", name, suffix)),
                constant => constant.clone(),
            })
            .collect(),
    )
}

fn resolve(term: &Term, subst: &Substitution) -> Term {
    let mut current = term;
    while let Term::Var(name) = current {
        match subst.get(name) {
            Some(next) => current = next,
            None => break,
        }
    }
    current.clone()
}

fn unify(left: &Term, right: &Term, subst: &mut Substitution) -> bool {
    match (resolve(left, subst), resolve(right, subst)) {
        (Term::Const(a), Term::Const(b)) => a == b,
        (Term::Var(a), Term::Var(b)) if a == b => true,
        (Term::Var(var), other) | (other, Term::Var(var)) => {
            subst.insert(var, other);
            true
        }
    }
}

fn unify_atoms(pattern: &Atom, fact: &Atom, mut subst: Substitution) -> Option<Substitution> {
    if pattern.predicate != fact.predicate || pattern.arity() != fact.arity() {
        return None;
    }
    pattern
        .args
        .iter()
        .zip(&fact.args)
        .all(|(p, f)| unify(p, f, &mut subst))
        .then_some(subst)
}

fn substitute(atom: &Atom, subst: &Substitution) -> Atom {
    Atom::new(
        atom.predicate.clone(),
        atom.args.iter().map(|t| resolve(t, subst)).collect(),
    )
}

/// Rename variables to `?0`, `?1`, ... in order of first appearance
fn normalize(atom: &Atom) -> Atom {
    let mut names: Vec<String> = Vec::new();
    let args = atom
        .args
        .iter()
        .map(|t| match t {
            Term::Var(name) => {
                let index = match names.iter().position(|n| n == name) {
                    Some(i) => i,
                    None => {
                        names.push(name.clone());
                        names.len() - 1
                    }
                };
                Term::Var(format!("?{}", index))
            }
            constant => constant.clone(),
        })
        .collect();
    Atom::new(atom.predicate.clone(), args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syntax::{parse_atom, parse_program};
    use pgc_core::{RequestContext, Value};

    fn rule_set(text: &str) -> Arc<RuleSet> {
        let program = parse_program(text).unwrap();
        Arc::new(RuleSet::new(1, Vec::new(), program.clauses))
    }

    fn goal(text: &str) -> Atom {
        parse_atom(text).unwrap()
    }

    const ADMIN_RULE: &str = "permit(U, A, R) :- hasRole(U, \"admin\").";

    fn context(role: &str) -> RequestContext {
        RequestContext::new()
            .with_user("id", "alice")
            .with_user("role", role)
            .with_action("type", "delete")
            .with_resource("id", "doc1")
    }

    #[test]
    fn test_admin_is_permitted() {
        let mut evaluator = Evaluator::new(rule_set(ADMIN_RULE));
        evaluator.assert_facts(context("admin").to_facts().unwrap()).unwrap();

        let result = evaluator
            .query(&goal(r#"permit("alice", "delete", "doc1")"#))
            .unwrap();
        assert!(result.has_result);
        assert_eq!(result.bindings, vec![Binding::new()]);
    }

    #[test]
    fn test_viewer_is_denied() {
        let mut evaluator = Evaluator::new(rule_set(ADMIN_RULE));
        evaluator.assert_facts(context("viewer").to_facts().unwrap()).unwrap();

        let result = evaluator
            .query(&goal(r#"permit("alice", "delete", "doc1")"#))
            .unwrap();
        assert!(!result.has_result);
        assert!(result.bindings.is_empty());
    }

    #[test]
    fn test_variable_query_bindings_in_derivation_order() {
        let mut evaluator = Evaluator::new(rule_set(
            "parent(\"a\", \"b\").\nparent(\"b\", \"c\").\n\
             ancestor(X, Y) :- parent(X, Y).\n\
             ancestor(X, Z) :- parent(X, Y), ancestor(Y, Z).",
        ));

        let result = evaluator.query(&goal("ancestor(\"a\", Who)")).unwrap();
        let who: Vec<&Term> = result.bindings.iter().map(|b| &b["Who"]).collect();
        assert_eq!(who, vec![&Term::string("b"), &Term::string("c")]);
    }

    #[test]
    fn test_unsafe_head_is_universal() {
        let mut evaluator = Evaluator::new(rule_set("permit(\"root\", A, R).\nadmin(U) :- permit(U, \"x\", \"y\")."));

        let result = evaluator.query(&goal("permit(\"root\", \"read\", \"anything\")")).unwrap();
        assert!(result.has_result);

        let result = evaluator.query(&goal("admin(Who)")).unwrap();
        assert_eq!(result.bindings.len(), 1);
        assert_eq!(result.bindings[0]["Who"], Term::string("root"));

        let result = evaluator.query(&goal("permit(\"root\", What, \"doc\")")).unwrap();
        assert_eq!(result.bindings[0]["What"], Term::var(UNBOUND));
    }

    #[test]
    fn test_join_through_shared_value() {
        let mut evaluator = Evaluator::new(rule_set(
            "permit(U, A, R) :- hasDepartment(U, D), resourceHasDepartment(R, D).",
        ));
        let ctx = RequestContext::new()
            .with_user("id", "bob")
            .with_user("department", "eng")
            .with_action("type", "read")
            .with_resource("id", "handbook")
            .with_resource("department", "eng");
        evaluator.assert_facts(ctx.to_facts().unwrap()).unwrap();

        assert!(evaluator
            .query(&goal(r#"permit("bob", "read", "handbook")"#))
            .unwrap()
            .has_result);
    }

    #[test]
    fn test_non_ground_fact_rejected() {
        let mut evaluator = Evaluator::new(rule_set(ADMIN_RULE));
        let err = evaluator
            .assert_facts(vec![Atom::new("hasRole", vec![Term::var("X"), Term::string("admin")])])
            .unwrap_err();
        assert!(matches!(err, EvalError::NonGroundFact(_)));
    }

    #[test]
    fn test_iteration_cap_is_inconclusive() {
        let chain: String = (0..10)
            .map(|i| format!("p{}(X) :- p{}(X).\n", i + 1, i))
            .collect();
        let rules = rule_set(&format!("p0(\"a\").\n{}", chain));

        let limits = EvaluatorLimits {
            max_iterations: 3,
            max_facts: 1_000,
        };
        let mut evaluator = Evaluator::with_limits(Arc::clone(&rules), limits);
        assert!(matches!(
            evaluator.query(&goal("p10(\"a\")")),
            Err(EvalError::Inconclusive { iterations: 4, .. })
        ));

        let mut evaluator = Evaluator::new(rules);
        assert!(evaluator.query(&goal("p10(\"a\")")).unwrap().has_result);
    }

    #[test]
    fn test_derivation_using_every_allowed_round_completes() {
        let rules = rule_set("p0(\"a\").\np1(X) :- p0(X).\np2(X) :- p1(X).\np3(X) :- p2(X).");
        let limits = EvaluatorLimits {
            max_iterations: 3,
            max_facts: 1_000,
        };

        let mut evaluator = Evaluator::with_limits(rules, limits);
        let result = evaluator.query(&goal("p3(\"a\")")).unwrap();
        assert!(result.has_result);
        assert_eq!(result.iterations, 4);
    }

    #[test]
    fn test_fact_cap_is_inconclusive() {
        let rules = rule_set("n(1).\nn(2).\nn(3).\npair(X, Y) :- n(X), n(Y).");
        let limits = EvaluatorLimits {
            max_iterations: 64,
            max_facts: 5,
        };
        let mut evaluator = Evaluator::with_limits(rules, limits);
        assert!(matches!(
            evaluator.query(&goal("pair(1, 2)")),
            Err(EvalError::Inconclusive { .. })
        ));
    }

    #[test]
    fn test_cyclic_rules_terminate() {
        let mut evaluator = Evaluator::new(rule_set(
            "edge(1, 2).\nedge(2, 1).\nreach(X, Y) :- edge(X, Y).\nreach(X, Z) :- reach(X, Y), reach(Y, Z).",
        ));
        let result = evaluator.query(&goal("reach(1, X)")).unwrap();
        let mut reached: Vec<Term> = result.bindings.into_iter().map(|mut b| b.remove("X").unwrap()).collect();
        reached.sort();
        assert_eq!(
            reached,
            vec![Term::Const(Value::Int(1)), Term::Const(Value::Int(2))]
        );
    }

    #[test]
    fn test_evaluators_do_not_share_facts() {
        let rules = rule_set(ADMIN_RULE);
        let query = goal(r#"permit("alice", "delete", "doc1")"#);

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let rules = Arc::clone(&rules);
                    let query = query.clone();
                    scope.spawn(move || {
                        let role = if i % 2 == 0 { "admin" } else { "viewer" };
                        let mut evaluator = Evaluator::new(rules);
                        evaluator.assert_facts(context(role).to_facts().unwrap()).unwrap();
                        (i, evaluator.query(&query).unwrap().has_result)
                    })
                })
                .collect();

            for handle in handles {
                let (i, permitted) = handle.join().unwrap();
                assert_eq!(permitted, i % 2 == 0);
            }
        });
    }
}
