//! Declarative plan: the ordered steps a request compiles to.

use crate::pipeline::lookup::{Lookup, LookupRef};
use std::sync::Arc;

/// Sort, offset and limit for one segment of the plan
#[derive(Debug, Clone, PartialEq)]
pub struct ArrangeStep {
    /// Property names without `@`; `None` when no SORTBY was given
    pub sort_keys: Option<Vec<String>>,
    /// Bit `i` set means sort key `i` is ascending
    pub sort_asc_map: u64,
    pub offset: u64,
    pub limit: u64,
    /// LIMIT was given explicitly
    pub is_limited: bool,
}

impl Default for ArrangeStep {
    fn default() -> Self {
        Self {
            sort_keys: None,
            sort_asc_map: u64::MAX,
            offset: 0,
            limit: 0,
            is_limited: false,
        }
    }
}

/// One `REDUCE name nargs args [AS alias]` clause
#[derive(Debug, Clone, PartialEq)]
pub struct ReducerSpec {
    pub name: String,
    pub args: Vec<String>,
    pub alias: String,
}

impl ReducerSpec {
    pub fn new(name: &str, args: Vec<String>, alias: Option<String>) -> Self {
        let alias = alias.unwrap_or_else(|| generated_alias(name, &args));
        Self {
            name: name.to_string(),
            args,
            alias,
        }
    }
}

/// `__generated_alias` + function + arguments with `@` stripped, lowercased
pub fn generated_alias(name: &str, args: &[String]) -> String {
    let joined: Vec<&str> = args
        .iter()
        .map(|a| a.strip_prefix('@').unwrap_or(a))
        .collect();
    format!("__generated_alias{}{}", name, joined.join(",")).to_lowercase()
}

/// GROUPBY with its reducers; owns the registry seen by later steps
#[derive(Debug)]
pub struct GroupStep {
    /// Group-by property names without `@`
    pub properties: Vec<String>,
    pub reducers: Vec<ReducerSpec>,
    pub lookup: LookupRef,
}

impl GroupStep {
    pub fn new(properties: Vec<String>) -> Self {
        Self {
            properties,
            reducers: Vec::new(),
            lookup: Lookup::new_shared(),
        }
    }
}

/// APPLY or FILTER expression
#[derive(Debug, Clone, PartialEq)]
pub struct MapFilterStep {
    pub expr: String,
    /// Output name for APPLY; unused by FILTER
    pub alias: Option<String>,
    /// Reject an alias that already names a key instead of overwriting it
    pub no_override: bool,
}

impl MapFilterStep {
    pub fn apply(expr: &str, alias: &str) -> Self {
        Self {
            expr: expr.to_string(),
            alias: Some(alias.to_string()),
            no_override: false,
        }
    }

    pub fn filter(expr: &str) -> Self {
        Self {
            expr: expr.to_string(),
            alias: None,
            no_override: false,
        }
    }
}

/// LOAD: explicit `path [AS name]` list or everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadStep {
    pub args: Vec<String>,
    pub load_all: bool,
}

#[derive(Debug)]
pub enum Step {
    /// Implicit index scan, owns the first registry
    Root { lookup: LookupRef },
    Arrange(ArrangeStep),
    Group(GroupStep),
    Apply(MapFilterStep),
    Filter(MapFilterStep),
    Load(LoadStep),
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::Root { .. } => "ROOT",
            Step::Arrange(_) => "ARRANGE",
            Step::Group(_) => "GROUP",
            Step::Apply(_) => "APPLY",
            Step::Filter(_) => "FILTER",
            Step::Load(_) => "LOAD",
        }
    }

    /// Registry owned by this step, if any
    pub fn lookup(&self) -> Option<&LookupRef> {
        match self {
            Step::Root { lookup } => Some(lookup),
            Step::Group(g) => Some(&g.lookup),
            _ => None,
        }
    }

    /// Steps after which a new ARRANGE segment starts
    fn ends_arrange_segment(&self) -> bool {
        matches!(self, Step::Group(_) | Step::Apply(_) | Step::Filter(_))
    }
}

/// Ordered list of steps, always starting with ROOT
#[derive(Debug)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Default for Plan {
    fn default() -> Self {
        Self::new()
    }
}

impl Plan {
    pub fn new() -> Self {
        Self {
            steps: vec![Step::Root {
                lookup: Lookup::new_shared(),
            }],
        }
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Arrange step of the current segment, created at the tail if missing.
    ///
    /// The search goes backwards and stops at the first step that reshapes
    /// rows, so LIMIT and SORTBY given on either side of a GROUP, APPLY or
    /// FILTER land in different steps.
    pub fn get_or_create_arrange(&mut self) -> &mut ArrangeStep {
        let mut found = None;
        for (i, step) in self.steps.iter().enumerate().rev() {
            if step.ends_arrange_segment() {
                break;
            }
            if matches!(step, Step::Arrange(_)) {
                found = Some(i);
                break;
            }
        }
        let at = match found {
            Some(i) => i,
            None => {
                self.steps.push(Step::Arrange(ArrangeStep::default()));
                self.steps.len() - 1
            }
        };
        match &mut self.steps[at] {
            Step::Arrange(arrange) => arrange,
            _ => unreachable!("index points at an arrange step"),
        }
    }

    /// Whether any GROUP, APPLY or FILTER step has been added
    pub fn has_projection(&self) -> bool {
        self.steps.iter().any(Step::ends_arrange_segment)
    }

    pub fn has_arrange(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, Step::Arrange(_)))
    }

    /// An ARRANGE with sort keys comes before any GROUP
    pub fn has_query_sortby(&self) -> bool {
        for step in &self.steps {
            match step {
                Step::Group(_) => return false,
                Step::Arrange(a) if a.sort_keys.is_some() => return true,
                _ => {}
            }
        }
        false
    }

    /// Root registry
    pub fn first_lookup(&self) -> LookupRef {
        match &self.steps[0] {
            Step::Root { lookup } => Arc::clone(lookup),
            _ => unreachable!("plan always starts with ROOT"),
        }
    }

    /// Registry in effect for the step at `idx`: the nearest owner before it
    pub fn lookup_before(&self, idx: usize) -> LookupRef {
        self.steps[..idx.min(self.steps.len())]
            .iter()
            .rev()
            .find_map(Step::lookup)
            .map(Arc::clone)
            .unwrap_or_else(|| self.first_lookup())
    }

    /// Registry the output is read from
    pub fn last_lookup(&self) -> LookupRef {
        self.lookup_before(self.steps.len())
    }

    pub fn is_root_lookup(&self, lookup: &LookupRef) -> bool {
        Arc::ptr_eq(lookup, &self.first_lookup())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_alias() {
        let args = vec!["@Price".to_string(), "0.5".to_string()];
        assert_eq!(generated_alias("QUANTILE", &args), "__generated_aliasquantileprice,0.5");
        assert_eq!(generated_alias("COUNT", &[]), "__generated_aliascount");
        let spec = ReducerSpec::new("SUM", vec!["@x".into()], Some("total".into()));
        assert_eq!(spec.alias, "total");
    }

    #[test]
    fn test_arrange_reused_within_segment() {
        let mut plan = Plan::new();
        plan.get_or_create_arrange().limit = 5;
        plan.push(Step::Load(LoadStep::default()));
        plan.get_or_create_arrange().offset = 2;
        let arranges: Vec<&ArrangeStep> = plan
            .steps()
            .iter()
            .filter_map(|s| match s {
                Step::Arrange(a) => Some(a),
                _ => None,
            })
            .collect();
        assert_eq!(arranges.len(), 1);
        assert_eq!((arranges[0].offset, arranges[0].limit), (2, 5));
    }

    #[test]
    fn test_arrange_segment_ends_at_group() {
        let mut plan = Plan::new();
        plan.get_or_create_arrange().sort_keys = Some(vec!["a".into()]);
        plan.push(Step::Group(GroupStep::new(vec!["a".into()])));
        assert!(plan.get_or_create_arrange().sort_keys.is_none());
        assert_eq!(plan.len(), 4);
        assert!(plan.has_query_sortby());
    }

    #[test]
    fn test_query_sortby_only_before_group() {
        let mut plan = Plan::new();
        plan.push(Step::Group(GroupStep::new(vec!["a".into()])));
        plan.get_or_create_arrange().sort_keys = Some(vec!["a".into()]);
        assert!(!plan.has_query_sortby());
    }

    #[test]
    fn test_lookup_resolution() {
        let mut plan = Plan::new();
        let root = plan.first_lookup();
        plan.push(Step::Apply(MapFilterStep::apply("1", "one")));
        assert!(Arc::ptr_eq(&plan.lookup_before(1), &root));

        plan.push(Step::Group(GroupStep::new(vec!["one".into()])));
        plan.push(Step::Filter(MapFilterStep::filter("1")));
        // The group step itself still reads from the root registry
        assert!(plan.is_root_lookup(&plan.lookup_before(2)));
        assert!(!plan.is_root_lookup(&plan.lookup_before(3)));
        assert!(!plan.is_root_lookup(&plan.last_lookup()));
        assert!(plan.has_projection());
    }
}
