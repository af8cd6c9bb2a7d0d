//! Represents parsed manifest strings with embedded variable references, e.g.
//! `c++ $in -o $out`, and the scope chain used to expand them into plain
//! strings.

use crate::smallmap::SmallMap;
use std::{borrow::Cow, collections::HashMap};

/// An environment providing a mapping of variable name to variable value.
/// A given EvalString may be expanded against a chain of environments,
/// innermost scope first; the first hit wins and an unbound variable expands
/// to the empty string.
pub trait Env {
    fn get_var(&self, var: &str) -> Option<Cow<str>>;
}

/// One segment within an EvalString, either literal text or a variable
/// reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalPart<T: AsRef<str>> {
    Literal(T),
    VarRef(T),
}

/// A parsed but unexpanded string, e.g. "cc $in -o $out".  Generic over the
/// text type: EvalString<&str> borrows the manifest buffer for strings
/// expanded during parsing, while EvalString<String> owns its text for
/// delayed expansion as in `rule` blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalString<T: AsRef<str>>(Vec<EvalPart<T>>);

impl<T: AsRef<str>> EvalString<T> {
    pub fn new(parts: Vec<EvalPart<T>>) -> Self {
        EvalString(parts)
    }

    /// Expand against a scope chain.  Expansion is pure: no state anywhere is
    /// modified, so evaluating twice yields identical bytes.
    pub fn evaluate(&self, envs: &[&dyn Env]) -> String {
        let mut val = String::new();
        for part in &self.0 {
            match part {
                EvalPart::Literal(s) => val.push_str(s.as_ref()),
                EvalPart::VarRef(v) => {
                    for env in envs {
                        if let Some(v) = env.get_var(v.as_ref()) {
                            val.push_str(&v);
                            break;
                        }
                    }
                }
            }
        }
        val
    }
}

impl EvalString<&str> {
    pub fn into_owned(self) -> EvalString<String> {
        EvalString(
            self.0
                .into_iter()
                .map(|part| match part {
                    EvalPart::Literal(s) => EvalPart::Literal(s.to_owned()),
                    EvalPart::VarRef(s) => EvalPart::VarRef(s.to_owned()),
                })
                .collect(),
        )
    }
}

/// A file-level scope: variable definitions accumulated as `var = value`
/// lines are read.  Values are fully expanded at definition time.
#[derive(Debug, Default, Clone)]
pub struct Vars(HashMap<String, String>);

impl Vars {
    pub fn insert(&mut self, key: String, val: String) {
        self.0.insert(key, val);
    }
    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }
}

impl Env for Vars {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.0.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

// The variables of a rule block, unexpanded until an edge provides context.
impl Env for SmallMap<String, EvalString<String>> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        // Note this expands the rule variable against an empty scope, so a
        // rule variable referencing another rule variable comes out empty.
        // Matching the reference implementation, which resolves these
        // against the edge's own bindings only.
        self.get(var).map(|val| Cow::Owned(val.evaluate(&[])))
    }
}

// The already-expanded bindings attached to a single build statement.
impl Env for SmallMap<&str, String> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        self.get(var).map(|val| Cow::Borrowed(val.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_walks_scopes_in_order() {
        let mut outer = Vars::default();
        outer.insert("x".to_owned(), "outer".to_owned());
        outer.insert("y".to_owned(), "seen".to_owned());
        let mut inner = Vars::default();
        inner.insert("x".to_owned(), "inner".to_owned());

        let s = EvalString::new(vec![
            EvalPart::VarRef("x"),
            EvalPart::Literal(" "),
            EvalPart::VarRef("y"),
        ]);
        assert_eq!(s.evaluate(&[&inner, &outer]), "inner seen");
    }

    #[test]
    fn unbound_variable_is_empty() {
        let s = EvalString::new(vec![EvalPart::Literal("a"), EvalPart::VarRef("nope")]);
        assert_eq!(s.evaluate(&[]), "a");
    }

    #[test]
    fn expansion_is_pure() {
        let mut vars = Vars::default();
        vars.insert("v".to_owned(), "val".to_owned());
        let s = EvalString::new(vec![EvalPart::VarRef("v")]);
        assert_eq!(s.evaluate(&[&vars]), s.evaluate(&[&vars]));
    }
}
