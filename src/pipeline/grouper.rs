//! Hash aggregation stage for GROUPBY.

use super::lookup::KeyId;
use super::processor::{ExecCtx, ProcessorKind, Pull, ResultProcessor, Upstream};
use super::reducers::{Accumulator, Reducer};
use super::row::Row;
use super::value::Value;
use crate::error::Result;
use ahash::AHashMap;
use std::collections::VecDeque;
use tracing::debug;

struct Group {
    values: Vec<Value>,
    accumulators: Vec<Box<dyn Accumulator>>,
}

/// Buckets rows by their group-by values and runs the reducers per bucket.
///
/// Source keys live in the upstream registry; output keys live in the
/// registry owned by the GROUP step.
pub struct Grouper {
    src_keys: Vec<KeyId>,
    dst_keys: Vec<KeyId>,
    reducers: Vec<(Box<dyn Reducer>, KeyId)>,
    index: AHashMap<Vec<u8>, usize>,
    groups: Vec<Group>,
    output: Option<VecDeque<Row>>,
}

impl Grouper {
    pub fn new(src_keys: Vec<KeyId>, dst_keys: Vec<KeyId>) -> Self {
        Self {
            src_keys,
            dst_keys,
            reducers: Vec::new(),
            index: AHashMap::new(),
            groups: Vec::new(),
            output: None,
        }
    }

    /// Add a reducer writing its result to `dst`
    pub fn add_reducer(&mut self, reducer: Box<dyn Reducer>, dst: KeyId) {
        self.reducers.push((reducer, dst));
    }

    pub fn num_reducers(&self) -> usize {
        self.reducers.len()
    }

    fn accumulate(&mut self, row: &Row) {
        // One bucket per combination of array elements
        let mut combos: Vec<Vec<Value>> = vec![Vec::with_capacity(self.src_keys.len())];
        for key in &self.src_keys {
            let choices: Vec<Value> = match row.get(*key) {
                Some(Value::Array(items)) if !items.is_empty() => items.clone(),
                Some(value) => vec![value.clone()],
                None => vec![Value::Null],
            };
            if choices.len() == 1 {
                for combo in combos.iter_mut() {
                    combo.push(choices[0].clone());
                }
                continue;
            }
            let mut expanded = Vec::with_capacity(combos.len() * choices.len());
            for combo in &combos {
                for choice in &choices {
                    let mut next = combo.clone();
                    next.push(choice.clone());
                    expanded.push(next);
                }
            }
            combos = expanded;
        }

        for values in combos {
            let mut hash_key = Vec::new();
            for v in &values {
                v.write_group_key(&mut hash_key);
            }
            let slot = match self.index.get(&hash_key) {
                Some(slot) => *slot,
                None => {
                    let slot = self.groups.len();
                    self.groups.push(Group {
                        values,
                        accumulators: self.reducers.iter().map(|(r, _)| r.new_accumulator()).collect(),
                    });
                    self.index.insert(hash_key, slot);
                    slot
                }
            };
            for acc in self.groups[slot].accumulators.iter_mut() {
                acc.add(row);
            }
        }
    }

    fn finish(&mut self) {
        debug!(groups = self.groups.len(), "grouper finished accumulating");
        self.index.clear();
        let groups = std::mem::take(&mut self.groups);
        let mut out = VecDeque::with_capacity(groups.len());
        for mut group in groups {
            let mut row = Row::new();
            for (key, value) in self.dst_keys.iter().zip(group.values.drain(..)) {
                row.set(*key, value);
            }
            for ((_, dst), acc) in self.reducers.iter().zip(group.accumulators.iter_mut()) {
                row.set(*dst, acc.finish());
            }
            out.push_back(row);
        }
        self.output = Some(out);
    }
}

impl ResultProcessor for Grouper {
    fn kind(&self) -> ProcessorKind {
        ProcessorKind::Grouper
    }

    fn next(&mut self, up: &mut Upstream<'_>, ctx: &mut ExecCtx<'_>) -> Result<Pull> {
        if self.output.is_none() {
            loop {
                match up.pull(ctx)? {
                    Pull::Row(row) => self.accumulate(&row),
                    Pull::Eof | Pull::TimedOut => break,
                }
            }
            self.finish();
        }
        let next = self.output.as_mut().and_then(|rows| rows.pop_front());
        Ok(next.map(Pull::Row).unwrap_or(Pull::Eof))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;
    use crate::pipeline::reducers::create_reducer;

    fn row(cat: Value, price: f64) -> Row {
        let mut r = Row::new();
        r.set(0, cat);
        r.set(1, Value::from(price));
        r
    }

    fn reducer(name: &str, args: &[&str]) -> Box<dyn Reducer> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let mut resolve = |p: &str| match p {
            "price" => Ok(1),
            other => Err(QueryError::no_prop(other.to_string())),
        };
        create_reducer(name, &args, &mut resolve).ok().unwrap()
    }

    fn run(grouper: &mut Grouper, rows: Vec<Row>) -> Vec<Row> {
        for r in &rows {
            grouper.accumulate(r);
        }
        grouper.finish();
        grouper.output.take().unwrap().into_iter().collect()
    }

    #[test]
    fn test_groups_in_first_seen_order() {
        // Output registry: 0 = cat, 1 = count, 2 = total
        let mut g = Grouper::new(vec![0], vec![0]);
        g.add_reducer(reducer("COUNT", &[]), 1);
        g.add_reducer(reducer("SUM", &["@price"]), 2);

        let out = run(
            &mut g,
            vec![
                row("b".into(), 1.0),
                row("a".into(), 2.0),
                row("b".into(), 3.0),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get(0), Some(&Value::from("b")));
        assert_eq!(out[0].get(1), Some(&Value::from(2.0)));
        assert_eq!(out[0].get(2), Some(&Value::from(4.0)));
        assert_eq!(out[1].get(0), Some(&Value::from("a")));
        assert_eq!(out[1].get(1), Some(&Value::from(1.0)));
    }

    #[test]
    fn test_array_values_expand() {
        let mut g = Grouper::new(vec![0], vec![0]);
        g.add_reducer(reducer("COUNT", &[]), 1);
        let tags = Value::Array(vec!["x".into(), "y".into()]);
        let out = run(&mut g, vec![row(tags, 1.0), row("x".into(), 1.0)]);

        let counts: Vec<(Value, Value)> = out
            .iter()
            .map(|r| (r.get(0).cloned().unwrap(), r.get(1).cloned().unwrap()))
            .collect();
        assert_eq!(
            counts,
            vec![
                (Value::from("x"), Value::from(2.0)),
                (Value::from("y"), Value::from(1.0)),
            ]
        );
    }

    #[test]
    fn test_missing_values_group_as_null() {
        let mut g = Grouper::new(vec![5], vec![0]);
        g.add_reducer(reducer("COUNT", &[]), 1);
        let out = run(&mut g, vec![row("a".into(), 1.0), row("b".into(), 2.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get(0), Some(&Value::Null));
        assert_eq!(out[0].get(1), Some(&Value::from(2.0)));
    }

    #[test]
    fn test_numeric_zero_groups_together() {
        let mut g = Grouper::new(vec![1], vec![0]);
        g.add_reducer(reducer("COUNT", &[]), 1);
        let out = run(&mut g, vec![row("a".into(), 0.0), row("a".into(), -0.0)]);
        assert_eq!(out.len(), 1);
        assert_eq!(g.num_reducers(), 1);
    }
}
