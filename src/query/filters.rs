//! Legacy request-level filters: `FILTER field min max` and
//! `GEOFILTER field lon lat radius unit`.
//!
//! They apply to the whole query as a document set intersected with the
//! query's matches.

use crate::aggregate::args::{ArgError, ArgsCursor};
use crate::error::{QueryError, Result};
use crate::index::memory::MemoryIndex;
use crate::index::types::FieldType;
use roaring::RoaringBitmap;

/// Numeric bounds on one field
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyNumericFilter {
    pub field: String,
    pub min: f64,
    pub max: f64,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

/// Distance units accepted by GEOFILTER
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoUnit {
    Meters,
    Kilometers,
    Miles,
    Feet,
}

impl GeoUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "m" => Some(GeoUnit::Meters),
            "km" => Some(GeoUnit::Kilometers),
            "mi" => Some(GeoUnit::Miles),
            "ft" => Some(GeoUnit::Feet),
            _ => None,
        }
    }

    pub fn to_meters(&self, value: f64) -> f64 {
        match self {
            GeoUnit::Meters => value,
            GeoUnit::Kilometers => value * 1000.0,
            GeoUnit::Miles => value * 1609.34,
            GeoUnit::Feet => value * 0.3048,
        }
    }
}

/// Radius search around a point
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyGeoFilter {
    pub field: String,
    pub lon: f64,
    pub lat: f64,
    pub radius: f64,
    pub unit: GeoUnit,
}

/// Parse the arguments following `FILTER`. Sets `has_empty` when a bound
/// was given as an empty string.
pub fn parse_numeric_filter(ac: &mut ArgsCursor<'_>, has_empty: &mut bool) -> Result<LegacyNumericFilter> {
    if ac.remaining() < 3 {
        return Err(QueryError::parse_args("FILTER requires 3 arguments"));
    }
    let field = ac.get_string().map_err(|e| QueryError::parse_args(format!("FILTER: {}", e)))?;
    let field = field.strip_prefix('@').unwrap_or(&field).to_string();
    let (min, min_inclusive) = parse_bound(ac, f64::NEG_INFINITY, has_empty)?;
    let (max, max_inclusive) = parse_bound(ac, f64::INFINITY, has_empty)?;
    Ok(LegacyNumericFilter {
        field,
        min,
        max,
        min_inclusive,
        max_inclusive,
    })
}

fn parse_bound(ac: &mut ArgsCursor<'_>, empty_value: f64, has_empty: &mut bool) -> Result<(f64, bool)> {
    let raw = ac.get_str().map_err(|e| QueryError::parse_args(format!("FILTER: {}", e)))?;
    if raw.is_empty() {
        *has_empty = true;
        return Ok((empty_value, true));
    }
    let (token, inclusive) = match raw.strip_prefix('(') {
        Some(rest) => (rest, false),
        None => (raw, true),
    };
    let value = match token.to_lowercase().as_str() {
        "-inf" => f64::NEG_INFINITY,
        "inf" | "+inf" => f64::INFINITY,
        t => t
            .parse::<f64>()
            .ok()
            .filter(|v| !v.is_nan())
            .ok_or_else(|| QueryError::parse_args(format!("Bad arguments for FILTER: `{}` is not a number", raw)))?,
    };
    Ok((value, inclusive))
}

/// Parse the arguments following `GEOFILTER`
pub fn parse_geo_filter(ac: &mut ArgsCursor<'_>, has_empty: &mut bool) -> Result<LegacyGeoFilter> {
    if ac.remaining() < 5 {
        return Err(QueryError::parse_args("GEOFILTER requires 5 arguments"));
    }
    let bad = |e: ArgError| QueryError::parse_args(format!("Bad arguments for GEOFILTER: {}", e));
    let field = ac.get_string().map_err(bad)?;
    let field = field.strip_prefix('@').unwrap_or(&field).to_string();

    let mut numbers = [0.0f64; 3];
    for slot in numbers.iter_mut() {
        let raw = ac.get_str().map_err(bad)?;
        if raw.is_empty() {
            *has_empty = true;
            continue;
        }
        *slot = raw
            .parse::<f64>()
            .map_err(|_| QueryError::parse_args(format!("Bad arguments for GEOFILTER: `{}` is not a number", raw)))?;
    }
    let [lon, lat, radius] = numbers;
    if !(-180.0..=180.0).contains(&lon) || !(-85.06..=85.06).contains(&lat) {
        return Err(QueryError::parse_args(format!(
            "Invalid GEOFILTER coordinates ({}, {})",
            lon, lat
        )));
    }
    if radius < 0.0 {
        return Err(QueryError::parse_args("GEOFILTER radius must be non negative"));
    }

    let unit_raw = ac.get_str().map_err(bad)?;
    let unit = GeoUnit::parse(unit_raw)
        .ok_or_else(|| QueryError::parse_args(format!("Unknown distance unit {}", unit_raw)))?;

    Ok(LegacyGeoFilter {
        field,
        lon,
        lat,
        radius,
        unit,
    })
}

/// Outcome of binding legacy filters to an index
#[derive(Debug, Clone, PartialEq)]
pub enum FilterBinding {
    /// Documents passing every filter
    Docs(RoaringBitmap),
    /// No filters were given
    Unfiltered,
    /// A filter named an invalid field under dialect 1: match nothing
    Empty,
}

/// Evaluate the legacy filters against `index`.
///
/// Under dialect 1 a filter on a missing or wrongly typed field yields an
/// empty result set instead of an error.
pub fn bind_filters(
    index: &MemoryIndex,
    numeric: &[LegacyNumericFilter],
    geo: &[LegacyGeoFilter],
    dialect: u32,
) -> Result<FilterBinding> {
    if numeric.is_empty() && geo.is_empty() {
        return Ok(FilterBinding::Unfiltered);
    }

    let mut docs = index.live_docs().clone();
    for filter in numeric {
        if let Err(err) = check_field(index, &filter.field, FieldType::Numeric, "numeric") {
            if dialect == 1 {
                return Ok(FilterBinding::Empty);
            }
            return Err(err);
        }
        docs &= index.numeric_docs(&filter.field, |v| {
            let above = if filter.min_inclusive { v >= filter.min } else { v > filter.min };
            let below = if filter.max_inclusive { v <= filter.max } else { v < filter.max };
            above && below
        })?;
    }
    for filter in geo {
        if let Err(err) = check_field(index, &filter.field, FieldType::Geo, "geo") {
            if dialect == 1 {
                return Ok(FilterBinding::Empty);
            }
            return Err(err);
        }
        docs &= index.geo_docs(
            &filter.field,
            filter.lon,
            filter.lat,
            filter.unit.to_meters(filter.radius),
        )?;
    }
    Ok(FilterBinding::Docs(docs))
}

fn check_field(index: &MemoryIndex, field: &str, expected: FieldType, label: &str) -> Result<()> {
    match index.field_spec_by_name(field) {
        None => Err(QueryError::inval(format!("Unknown Field '{}'", field))),
        Some(fs) if fs.field_type != expected => Err(QueryError::inval(format!(
            "Field is not a {} field, field: {}",
            label, field
        ))),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::{FieldSpec, IndexSpec};
    use crate::pipeline::value::Value;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn index() -> MemoryIndex {
        let mut idx = MemoryIndex::new(IndexSpec::new(
            "idx",
            vec![
                FieldSpec::new("title", FieldType::Text),
                FieldSpec::new("price", FieldType::Numeric),
                FieldSpec::new("loc", FieldType::Geo),
            ],
        ));
        for (key, price, loc) in [("a", 5.0, "2.35,48.85"), ("b", 15.0, "-0.1,51.5")] {
            idx.add_hash_document(
                key,
                vec![
                    ("price".into(), Value::from(price)),
                    ("loc".into(), Value::from(loc)),
                ],
                1.0,
            );
        }
        idx
    }

    #[test]
    fn test_parse_numeric_bounds() {
        let v = strings(&["@price", "(5", "+inf"]);
        let mut empty = false;
        let f = parse_numeric_filter(&mut ArgsCursor::new(&v), &mut empty).unwrap();
        assert_eq!(f.field, "price");
        assert!(!f.min_inclusive);
        assert_eq!(f.max, f64::INFINITY);
        assert!(!empty);

        let v = strings(&["price", "", "10"]);
        parse_numeric_filter(&mut ArgsCursor::new(&v), &mut empty).unwrap();
        assert!(empty);
    }

    #[test]
    fn test_parse_geo() {
        let v = strings(&["loc", "2.3", "48.8", "10", "km"]);
        let mut empty = false;
        let f = parse_geo_filter(&mut ArgsCursor::new(&v), &mut empty).unwrap();
        assert_eq!(f.unit, GeoUnit::Kilometers);

        let v = strings(&["loc", "2.3", "48.8", "10", "parsecs"]);
        assert!(parse_geo_filter(&mut ArgsCursor::new(&v), &mut empty).is_err());
    }

    #[test]
    fn test_bind_filters() {
        let idx = index();
        let numeric = vec![LegacyNumericFilter {
            field: "price".into(),
            min: 10.0,
            max: f64::INFINITY,
            min_inclusive: true,
            max_inclusive: true,
        }];
        match bind_filters(&idx, &numeric, &[], 2).unwrap() {
            FilterBinding::Docs(d) => assert_eq!(d.iter().collect::<Vec<_>>(), vec![1]),
            other => panic!("unexpected {:?}", other),
        }

        let geo = vec![LegacyGeoFilter {
            field: "loc".into(),
            lon: 2.35,
            lat: 48.85,
            radius: 5.0,
            unit: GeoUnit::Kilometers,
        }];
        match bind_filters(&idx, &[], &geo, 2).unwrap() {
            FilterBinding::Docs(d) => assert_eq!(d.iter().collect::<Vec<_>>(), vec![0]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_field_by_dialect() {
        let idx = index();
        let bad = vec![LegacyNumericFilter {
            field: "title".into(),
            min: 0.0,
            max: 1.0,
            min_inclusive: true,
            max_inclusive: true,
        }];
        assert_eq!(bind_filters(&idx, &bad, &[], 1).unwrap(), FilterBinding::Empty);

        let err = bind_filters(&idx, &bad, &[], 2).unwrap_err();
        assert_eq!(err.message, "Field is not a numeric field, field: title");
    }
}
