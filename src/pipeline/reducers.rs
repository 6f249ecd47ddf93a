//! Reducers: per-group aggregation functions used by GROUPBY ... REDUCE.
//!
//! A [`Reducer`] is built once per REDUCE clause from its arguments and hands
//! out one [`Accumulator`] per group.

use super::lookup::KeyId;
use super::row::Row;
use super::value::Value;
use crate::aggregate::args::ArgsCursor;
use crate::error::{QueryError, QueryErrorCode, Result};
use ahash::{AHashSet, RandomState};
use std::cmp::Ordering;

/// Per-group state of one reducer
pub trait Accumulator: Send {
    fn add(&mut self, row: &Row);
    fn finish(&mut self) -> Value;
}

/// A configured reducer
pub trait Reducer: Send {
    fn name(&self) -> &'static str;
    fn new_accumulator(&self) -> Box<dyn Accumulator>;
}

/// Inputs handed to a reducer factory
pub struct ReducerOptions<'a, 'r> {
    pub name: &'static str,
    pub args: ArgsCursor<'a>,
    /// Resolves a property name (without `@`) to a key of the source registry
    pub resolve: &'r mut dyn FnMut(&str) -> Result<KeyId>,
}

impl ReducerOptions<'_, '_> {
    fn bad_args(&self, e: impl std::fmt::Display) -> QueryError {
        QueryError::parse_args(format!("Bad arguments for {}: {}", self.name, e))
    }

    /// Read an `@property` argument and resolve it
    pub fn property(&mut self) -> Result<KeyId> {
        let raw = self.args.get_str().map_err(|e| self.bad_args(e))?;
        let Some(name) = raw.strip_prefix('@') else {
            return Err(self.bad_args(format!("Unknown property `{}`. Did you mean `@{}`?", raw, raw)));
        };
        (self.resolve)(name)
    }

    fn f64_arg(&mut self) -> Result<f64> {
        self.args.get_f64().map_err(|e| self.bad_args(e))
    }

    /// Fail if arguments are left over
    pub fn ensure_done(&self) -> Result<()> {
        match self.args.peek() {
            None => Ok(()),
            Some(extra) => Err(self.bad_args(format!("Unknown argument `{}`", extra))),
        }
    }
}

type ReducerFactory = fn(&mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>>;

const REDUCERS: &[(&str, ReducerFactory)] = &[
    ("COUNT", new_count),
    ("COUNT_DISTINCT", new_count_distinct),
    ("COUNT_DISTINCTISH", new_count_distinctish),
    ("SUM", new_sum),
    ("MIN", new_min),
    ("MAX", new_max),
    ("AVG", new_avg),
    ("TOLIST", new_tolist),
    ("FIRST_VALUE", new_first_value),
    ("STDDEV", new_stddev),
    ("QUANTILE", new_quantile),
];

/// Canonical (uppercase) name of a registered reducer
pub fn canonical_name(name: &str) -> Option<&'static str> {
    REDUCERS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(n, _)| *n)
}

/// Build the reducer `name` from its argument list
pub fn create_reducer(
    name: &str,
    args: &[String],
    resolve: &mut dyn FnMut(&str) -> Result<KeyId>,
) -> Result<Box<dyn Reducer>> {
    let Some((canonical, factory)) = REDUCERS.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)) else {
        return Err(QueryError::new(
            QueryErrorCode::NoReducer,
            format!("No such reducer: {}", name),
        ));
    };
    let mut opts = ReducerOptions {
        name: *canonical,
        args: ArgsCursor::new(args),
        resolve,
    };
    let reducer = factory(&mut opts)?;
    opts.ensure_done()?;
    Ok(reducer)
}

fn numbers<'v>(row: &'v Row, key: KeyId) -> impl Iterator<Item = f64> + 'v {
    row.get(key)
        .into_iter()
        .flat_map(|v| v.elements())
        .filter_map(|v| v.as_number())
}

// COUNT

struct Count;

struct CountAcc(u64);

impl Reducer for Count {
    fn name(&self) -> &'static str {
        "COUNT"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(CountAcc(0))
    }
}

impl Accumulator for CountAcc {
    fn add(&mut self, _row: &Row) {
        self.0 += 1;
    }

    fn finish(&mut self) -> Value {
        Value::Number(self.0 as f64)
    }
}

fn new_count(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    if !opts.args.is_at_end() {
        return Err(opts.bad_args("Count accepts 0 values only"));
    }
    Ok(Box::new(Count))
}

// COUNT_DISTINCT

struct CountDistinct {
    key: KeyId,
}

struct CountDistinctAcc {
    key: KeyId,
    seen: AHashSet<Vec<u8>>,
}

impl Reducer for CountDistinct {
    fn name(&self) -> &'static str {
        "COUNT_DISTINCT"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(CountDistinctAcc {
            key: self.key,
            seen: AHashSet::new(),
        })
    }
}

impl Accumulator for CountDistinctAcc {
    fn add(&mut self, row: &Row) {
        if let Some(value) = row.get(self.key) {
            let mut buf = Vec::new();
            value.write_group_key(&mut buf);
            self.seen.insert(buf);
        }
    }

    fn finish(&mut self) -> Value {
        Value::Number(self.seen.len() as f64)
    }
}

fn new_count_distinct(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(CountDistinct { key }))
}

// COUNT_DISTINCTISH: HyperLogLog with 2^8 registers

const HLL_BITS: u32 = 8;
const HLL_REGISTERS: usize = 1 << HLL_BITS;

struct CountDistinctish {
    key: KeyId,
}

struct HllAcc {
    key: KeyId,
    hasher: RandomState,
    registers: [u8; HLL_REGISTERS],
}

impl Reducer for CountDistinctish {
    fn name(&self) -> &'static str {
        "COUNT_DISTINCTISH"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(HllAcc {
            key: self.key,
            // Fixed seeds keep estimates reproducible
            hasher: RandomState::with_seeds(0x5eed, 0xfa11, 0xc0de, 0xbeef),
            registers: [0; HLL_REGISTERS],
        })
    }
}

impl Accumulator for HllAcc {
    fn add(&mut self, row: &Row) {
        let Some(value) = row.get(self.key) else {
            return;
        };
        let mut buf = Vec::new();
        value.write_group_key(&mut buf);
        let hash = self.hasher.hash_one(&buf);
        let idx = (hash >> (64 - HLL_BITS)) as usize;
        let rest = hash << HLL_BITS;
        let rank = (rest.leading_zeros() + 1).min(64 - HLL_BITS + 1) as u8;
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    fn finish(&mut self) -> Value {
        let m = HLL_REGISTERS as f64;
        let sum: f64 = self.registers.iter().map(|r| 2f64.powi(-(*r as i32))).sum();
        let alpha = 0.7213 / (1.0 + 1.079 / m);
        let raw = alpha * m * m / sum;
        let zeros = self.registers.iter().filter(|r| **r == 0).count();
        let estimate = if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else {
            raw
        };
        Value::Number(estimate.round())
    }
}

fn new_count_distinctish(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(CountDistinctish { key }))
}

// SUM / AVG

struct Sum {
    key: KeyId,
    average: bool,
}

struct SumAcc {
    key: KeyId,
    average: bool,
    total: f64,
    count: u64,
}

impl Reducer for Sum {
    fn name(&self) -> &'static str {
        if self.average {
            "AVG"
        } else {
            "SUM"
        }
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(SumAcc {
            key: self.key,
            average: self.average,
            total: 0.0,
            count: 0,
        })
    }
}

impl Accumulator for SumAcc {
    fn add(&mut self, row: &Row) {
        for n in numbers(row, self.key) {
            self.total += n;
            self.count += 1;
        }
    }

    fn finish(&mut self) -> Value {
        if !self.average {
            return Value::Number(self.total);
        }
        if self.count == 0 {
            return Value::Null;
        }
        Value::Number(self.total / self.count as f64)
    }
}

fn new_sum(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(Sum { key, average: false }))
}

fn new_avg(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(Sum { key, average: true }))
}

// MIN / MAX

struct Extreme {
    key: KeyId,
    want: Ordering,
}

struct ExtremeAcc {
    key: KeyId,
    want: Ordering,
    best: Option<f64>,
}

impl Reducer for Extreme {
    fn name(&self) -> &'static str {
        if self.want == Ordering::Less {
            "MIN"
        } else {
            "MAX"
        }
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(ExtremeAcc {
            key: self.key,
            want: self.want,
            best: None,
        })
    }
}

impl Accumulator for ExtremeAcc {
    fn add(&mut self, row: &Row) {
        for n in numbers(row, self.key) {
            let better = match self.best {
                None => true,
                Some(b) => n.partial_cmp(&b) == Some(self.want),
            };
            if better {
                self.best = Some(n);
            }
        }
    }

    fn finish(&mut self) -> Value {
        self.best.map(Value::Number).unwrap_or(Value::Null)
    }
}

fn new_min(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(Extreme {
        key,
        want: Ordering::Less,
    }))
}

fn new_max(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(Extreme {
        key,
        want: Ordering::Greater,
    }))
}

// TOLIST: distinct values in first-seen order

struct ToList {
    key: KeyId,
}

struct ToListAcc {
    key: KeyId,
    seen: AHashSet<Vec<u8>>,
    items: Vec<Value>,
}

impl Reducer for ToList {
    fn name(&self) -> &'static str {
        "TOLIST"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(ToListAcc {
            key: self.key,
            seen: AHashSet::new(),
            items: Vec::new(),
        })
    }
}

impl Accumulator for ToListAcc {
    fn add(&mut self, row: &Row) {
        let Some(value) = row.get(self.key) else {
            return;
        };
        for item in value.elements() {
            let mut buf = Vec::new();
            item.write_group_key(&mut buf);
            if self.seen.insert(buf) {
                self.items.push(item.clone());
            }
        }
    }

    fn finish(&mut self) -> Value {
        Value::Array(std::mem::take(&mut self.items))
    }
}

fn new_tolist(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(ToList { key }))
}

// FIRST_VALUE @v [BY @k [ASC|DESC]]

struct FirstValue {
    key: KeyId,
    by: Option<(KeyId, bool)>,
}

struct FirstValueAcc {
    key: KeyId,
    by: Option<(KeyId, bool)>,
    value: Option<Value>,
    sort_value: Option<Value>,
}

impl Reducer for FirstValue {
    fn name(&self) -> &'static str {
        "FIRST_VALUE"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(FirstValueAcc {
            key: self.key,
            by: self.by,
            value: None,
            sort_value: None,
        })
    }
}

impl Accumulator for FirstValueAcc {
    fn add(&mut self, row: &Row) {
        let Some((by_key, ascending)) = self.by else {
            if self.value.is_none() {
                self.value = Some(row.get(self.key).cloned().unwrap_or_default());
            }
            return;
        };
        let candidate = row.get(by_key);
        let replace = match (&self.sort_value, candidate) {
            _ if self.value.is_none() => true,
            (None, Some(_)) => true,
            (Some(_), None) | (None, None) => false,
            (Some(current), Some(new)) => {
                let ord = new.compare(current);
                if ascending {
                    ord == Ordering::Less
                } else {
                    ord == Ordering::Greater
                }
            }
        };
        if replace {
            self.value = Some(row.get(self.key).cloned().unwrap_or_default());
            self.sort_value = candidate.cloned();
        }
    }

    fn finish(&mut self) -> Value {
        self.value.take().unwrap_or_default()
    }
}

fn new_first_value(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    let mut by = None;
    if opts.args.advance_if_match("BY") {
        let by_key = opts.property()?;
        let ascending = if opts.args.advance_if_match("DESC") {
            false
        } else {
            opts.args.advance_if_match("ASC");
            true
        };
        by = Some((by_key, ascending));
    }
    Ok(Box::new(FirstValue { key, by }))
}

// STDDEV (sample)

struct StdDev {
    key: KeyId,
}

struct StdDevAcc {
    key: KeyId,
    count: u64,
    mean: f64,
    m2: f64,
}

impl Reducer for StdDev {
    fn name(&self) -> &'static str {
        "STDDEV"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(StdDevAcc {
            key: self.key,
            count: 0,
            mean: 0.0,
            m2: 0.0,
        })
    }
}

impl Accumulator for StdDevAcc {
    fn add(&mut self, row: &Row) {
        for n in numbers(row, self.key) {
            self.count += 1;
            let delta = n - self.mean;
            self.mean += delta / self.count as f64;
            self.m2 += delta * (n - self.mean);
        }
    }

    fn finish(&mut self) -> Value {
        if self.count < 2 {
            return Value::Number(0.0);
        }
        Value::Number((self.m2 / (self.count - 1) as f64).sqrt())
    }
}

fn new_stddev(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    Ok(Box::new(StdDev { key }))
}

// QUANTILE @v q

struct Quantile {
    key: KeyId,
    q: f64,
}

struct QuantileAcc {
    key: KeyId,
    q: f64,
    samples: Vec<f64>,
}

impl Reducer for Quantile {
    fn name(&self) -> &'static str {
        "QUANTILE"
    }

    fn new_accumulator(&self) -> Box<dyn Accumulator> {
        Box::new(QuantileAcc {
            key: self.key,
            q: self.q,
            samples: Vec::new(),
        })
    }
}

impl Accumulator for QuantileAcc {
    fn add(&mut self, row: &Row) {
        self.samples.extend(numbers(row, self.key));
    }

    fn finish(&mut self) -> Value {
        if self.samples.is_empty() {
            return Value::Null;
        }
        self.samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let pos = self.q * (self.samples.len() - 1) as f64;
        let lo = pos.floor() as usize;
        let hi = pos.ceil() as usize;
        let frac = pos - lo as f64;
        Value::Number(self.samples[lo] + (self.samples[hi] - self.samples[lo]) * frac)
    }
}

fn new_quantile(opts: &mut ReducerOptions<'_, '_>) -> Result<Box<dyn Reducer>> {
    let key = opts.property()?;
    let q = opts.f64_arg()?;
    if !(0.0..=1.0).contains(&q) {
        return Err(opts.bad_args("Quantile must be between 0.0 and 1.0"));
    }
    Ok(Box::new(Quantile { key, q }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// Resolves `v` to key 0 and `k` to key 1
    fn build(name: &str, a: &[&str]) -> Result<Box<dyn Reducer>> {
        let mut resolve = |p: &str| match p {
            "v" => Ok(0),
            "k" => Ok(1),
            other => Err(QueryError::no_prop(format!("No such property `{}`", other))),
        };
        create_reducer(name, &args(a), &mut resolve)
    }

    fn run(reducer: &dyn Reducer, rows: &[(Value, Value)]) -> Value {
        let mut acc = reducer.new_accumulator();
        for (v, k) in rows {
            let mut row = Row::new();
            if !v.is_null() {
                row.set(0, v.clone());
            }
            row.set(1, k.clone());
            acc.add(&row);
        }
        acc.finish()
    }

    fn nums(vals: &[f64]) -> Vec<(Value, Value)> {
        vals.iter().map(|v| (Value::from(*v), Value::Null)).collect()
    }

    #[test]
    fn test_unknown_reducer() {
        let err = build("MEDIANISH", &[]).err().unwrap();
        assert_eq!(err.code(), QueryErrorCode::NoReducer);
        assert_eq!(err.message, "No such reducer: MEDIANISH");
    }

    #[test]
    fn test_argument_errors_name_the_reducer() {
        let err = build("sum", &[]).err().unwrap();
        assert!(err.message.starts_with("Bad arguments for SUM"));

        let err = build("COUNT", &["@v"]).err().unwrap();
        assert!(err.message.starts_with("Bad arguments for COUNT"));

        let err = build("AVG", &["v"]).err().unwrap();
        assert!(err.message.contains("Did you mean `@v`?"));

        let err = build("QUANTILE", &["@v", "1.5"]).err().unwrap();
        assert!(err.message.contains("Quantile must be between 0.0 and 1.0"));
    }

    #[test]
    fn test_numeric_reducers() {
        let data = nums(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(run(&*build("SUM", &["@v"]).unwrap(), &data), Value::from(40.0));
        assert_eq!(run(&*build("AVG", &["@v"]).unwrap(), &data), Value::from(5.0));
        assert_eq!(run(&*build("MIN", &["@v"]).unwrap(), &data), Value::from(2.0));
        assert_eq!(run(&*build("MAX", &["@v"]).unwrap(), &data), Value::from(9.0));
        assert_eq!(run(&*build("COUNT", &[]).unwrap(), &data), Value::from(8.0));
        assert_eq!(
            run(&*build("COUNT_DISTINCT", &["@v"]).unwrap(), &data),
            Value::from(5.0)
        );
        assert_eq!(
            run(&*build("QUANTILE", &["@v", "0.5"]).unwrap(), &data),
            Value::from(4.5)
        );
        let Value::Number(sd) = run(&*build("STDDEV", &["@v"]).unwrap(), &data) else {
            panic!("expected number");
        };
        assert!((sd - 2.138).abs() < 0.001);
    }

    #[test]
    fn test_empty_group_values() {
        let data = vec![(Value::Null, Value::Null)];
        assert_eq!(run(&*build("MIN", &["@v"]).unwrap(), &data), Value::Null);
        assert_eq!(run(&*build("AVG", &["@v"]).unwrap(), &data), Value::Null);
        assert_eq!(run(&*build("SUM", &["@v"]).unwrap(), &data), Value::from(0.0));
    }

    #[test]
    fn test_tolist_flattens_and_dedups() {
        let data = vec![
            (Value::Array(vec!["a".into(), "b".into()]), Value::Null),
            (Value::from("a"), Value::Null),
            (Value::from("c"), Value::Null),
        ];
        assert_eq!(
            run(&*build("TOLIST", &["@v"]).unwrap(), &data),
            Value::Array(vec!["a".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn test_first_value_by() {
        let data = vec![
            (Value::from("mid"), Value::from(5.0)),
            (Value::from("low"), Value::from(1.0)),
            (Value::from("high"), Value::from(9.0)),
        ];
        assert_eq!(run(&*build("FIRST_VALUE", &["@v"]).unwrap(), &data), Value::from("mid"));
        assert_eq!(
            run(&*build("FIRST_VALUE", &["@v", "BY", "@k"]).unwrap(), &data),
            Value::from("low")
        );
        assert_eq!(
            run(&*build("FIRST_VALUE", &["@v", "BY", "@k", "DESC"]).unwrap(), &data),
            Value::from("high")
        );
    }

    #[test]
    fn test_count_distinctish_is_close() {
        let data: Vec<_> = (0..3).map(|i| (Value::from(i as f64), Value::Null)).collect();
        let Value::Number(n) = run(&*build("COUNT_DISTINCTISH", &["@v"]).unwrap(), &data) else {
            panic!("expected number");
        };
        assert!((2.0..=3.0).contains(&n));
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("count_distinct"), Some("COUNT_DISTINCT"));
        assert_eq!(canonical_name("nope"), None);
    }
}
