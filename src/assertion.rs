//! Named comparators used by validators and skip rules.
//!
//! Every comparator takes `(actual, expected)` and either returns
//! `Ok(())` or a [`ComparatorError`]. `Mismatch` is an ordinary
//! assertion failure; `Invalid` means the operands cannot be compared
//! at all (wrong types, bad pattern) and is reported as an error.
//! Comparators are found by numbered code (`_19length_equals`), plain
//! name (`length_equals`) or alias (`len_eq`).

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparatorError {
    Mismatch(String),
    Invalid(String),
}

impl std::fmt::Display for ComparatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComparatorError::Mismatch(m) | ComparatorError::Invalid(m) => f.write_str(m),
        }
    }
}

pub type CheckOutcome = Result<(), ComparatorError>;
pub type Comparator = fn(&Value, &Value) -> CheckOutcome;

/// A registered comparator.
#[derive(Clone, Copy, Serialize)]
pub struct ComparatorEntry {
    pub code: &'static str,
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    #[serde(skip)]
    pub func: Comparator,
}

impl std::fmt::Debug for ComparatorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComparatorEntry").field("code", &self.code).finish()
    }
}

macro_rules! entry {
    ($code:literal, $name:literal, [$($alias:literal),*], $desc:literal, $func:ident) => {
        ComparatorEntry {
            code: $code,
            name: $name,
            aliases: &[$($alias),*],
            description: $desc,
            func: $func,
        }
    };
}

static COMPARATORS: &[ComparatorEntry] = &[
    entry!("_01equals", "equals", ["eq", "=="], "actual equals expected", equals),
    entry!("_02not_equals", "not_equals", ["ne", "!="], "actual differs from expected", not_equals),
    entry!("_03string_equals", "string_equals", ["str_eq"], "stringified values are equal", string_equals),
    entry!("_04less_than", "less_than", ["lt", "<"], "actual < expected", less_than),
    entry!("_05less_or_equals", "less_or_equals", ["le", "<="], "actual <= expected", less_or_equals),
    entry!("_06greater_than", "greater_than", ["gt", ">"], "actual > expected", greater_than),
    entry!("_07greater_or_equals", "greater_or_equals", ["ge", ">="], "actual >= expected", greater_or_equals),
    entry!("_08contains", "contains", [], "actual contains expected", contains),
    entry!("_09not_contains", "not_contains", [], "actual does not contain expected", not_contains),
    entry!("_10contained_by", "contained_by", [], "expected contains actual", contained_by),
    entry!("_11not_contained_by", "not_contained_by", [], "expected does not contain actual", not_contained_by),
    entry!("_12startswith", "startswith", ["starts_with"], "string starts with expected", startswith),
    entry!("_13endswith", "endswith", ["ends_with"], "string ends with expected", endswith),
    entry!("_14regex_match", "regex_match", ["matches"], "string matches the pattern", regex_match),
    entry!("_15type_match", "type_match", [], "value has the expected type", type_match),
    entry!("_16is_true", "is_true", [], "value is exactly true", is_true),
    entry!("_17is_false", "is_false", [], "value is exactly false", is_false),
    entry!("_18is_none", "is_none", ["is_null"], "value is null", is_none),
    entry!("_19length_equals", "length_equals", ["len_eq", "count_eq"], "length equals expected", length_equals),
    entry!("_20length_greater_than", "length_greater_than", ["len_gt"], "length > expected", length_greater_than),
    entry!("_21length_greater_or_equals", "length_greater_or_equals", ["len_ge"], "length >= expected", length_greater_or_equals),
    entry!("_22length_less_than", "length_less_than", ["len_lt"], "length < expected", length_less_than),
    entry!("_23length_less_or_equals", "length_less_or_equals", ["len_le"], "length <= expected", length_less_or_equals),
    entry!("_24is_not_none", "is_not_none", ["is_not_null"], "value is not null", is_not_none),
    entry!("_25is_truthy", "is_truthy", [], "value is truthy", is_truthy),
    entry!("_26is_falsy", "is_falsy", [], "value is falsy", is_falsy),
    entry!("_27data_has_fields", "data_has_fields", [], "every record has the fields", data_has_fields),
    entry!("_28data_lacks_fields", "data_lacks_fields", [], "no record has the fields", data_lacks_fields),
    entry!("_29data_field_equals", "data_field_equals", [], "every record matches the field values", data_field_equals),
];

/// Find a comparator by code, name or alias.
pub fn lookup(name: &str) -> Option<&'static ComparatorEntry> {
    let name = name.trim();
    COMPARATORS
        .iter()
        .find(|e| e.code == name || e.name == name || e.aliases.contains(&name))
}

/// Every registered comparator, in code order.
pub fn list_comparators() -> &'static [ComparatorEntry] {
    COMPARATORS
}

fn mismatch(msg: String) -> CheckOutcome {
    Err(ComparatorError::Mismatch(msg))
}

fn invalid(msg: String) -> CheckOutcome {
    Err(ComparatorError::Invalid(msg))
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// Equality with `1 == 1.0`.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| loose_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter().all(|(k, v)| y.get(k).is_some_and(|w| loose_eq(v, w)))
        }
        _ => a == b,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn equals(actual: &Value, expected: &Value) -> CheckOutcome {
    if loose_eq(actual, expected) {
        Ok(())
    } else {
        mismatch(format!("expected {expected}, got {actual}"))
    }
}

fn not_equals(actual: &Value, expected: &Value) -> CheckOutcome {
    if loose_eq(actual, expected) {
        mismatch(format!("expected a value other than {expected}"))
    } else {
        Ok(())
    }
}

fn string_equals(actual: &Value, expected: &Value) -> CheckOutcome {
    let (a, e) = (stringify(actual), stringify(expected));
    if a == e {
        Ok(())
    } else {
        mismatch(format!("expected \"{e}\", got \"{a}\""))
    }
}

fn order(actual: &Value, expected: &Value) -> Result<Ordering, ComparatorError> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(e)) => {
            let (a, e) = (a.as_f64().unwrap_or(f64::NAN), e.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&e)
                .ok_or_else(|| ComparatorError::Invalid(format!("cannot order {a} and {e}")))
        }
        (Value::String(a), Value::String(e)) => Ok(a.cmp(e)),
        _ => Err(ComparatorError::Invalid(format!(
            "cannot order {} against {}",
            type_name(actual),
            type_name(expected)
        ))),
    }
}

fn ordered(
    actual: &Value,
    expected: &Value,
    op: &str,
    ok: fn(Ordering) -> bool,
) -> CheckOutcome {
    if ok(order(actual, expected)?) {
        Ok(())
    } else {
        mismatch(format!("expected {actual} {op} {expected}"))
    }
}

fn less_than(a: &Value, e: &Value) -> CheckOutcome {
    ordered(a, e, "<", |o| o == Ordering::Less)
}

fn less_or_equals(a: &Value, e: &Value) -> CheckOutcome {
    ordered(a, e, "<=", |o| o != Ordering::Greater)
}

fn greater_than(a: &Value, e: &Value) -> CheckOutcome {
    ordered(a, e, ">", |o| o == Ordering::Greater)
}

fn greater_or_equals(a: &Value, e: &Value) -> CheckOutcome {
    ordered(a, e, ">=", |o| o != Ordering::Less)
}

fn holds(container: &Value, item: &Value) -> Result<bool, ComparatorError> {
    match (container, item) {
        (Value::String(c), Value::String(i)) => Ok(c.contains(i.as_str())),
        (Value::String(_), other) => Err(ComparatorError::Invalid(format!(
            "cannot search a string for a {}",
            type_name(other)
        ))),
        (Value::Array(items), _) => Ok(items.iter().any(|v| loose_eq(v, item))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::Object(_), other) => Err(ComparatorError::Invalid(format!(
            "object keys are strings, got {}",
            type_name(other)
        ))),
        (other, _) => Err(ComparatorError::Invalid(format!(
            "a {} cannot contain anything",
            type_name(other)
        ))),
    }
}

fn contains(actual: &Value, expected: &Value) -> CheckOutcome {
    if holds(actual, expected)? {
        Ok(())
    } else {
        mismatch(format!("{actual} does not contain {expected}"))
    }
}

fn not_contains(actual: &Value, expected: &Value) -> CheckOutcome {
    if holds(actual, expected)? {
        mismatch(format!("{actual} contains {expected}"))
    } else {
        Ok(())
    }
}

fn contained_by(actual: &Value, expected: &Value) -> CheckOutcome {
    if holds(expected, actual)? {
        Ok(())
    } else {
        mismatch(format!("{actual} is not contained by {expected}"))
    }
}

fn not_contained_by(actual: &Value, expected: &Value) -> CheckOutcome {
    if holds(expected, actual)? {
        mismatch(format!("{actual} is contained by {expected}"))
    } else {
        Ok(())
    }
}

fn both_strings<'v>(
    actual: &'v Value,
    expected: &'v Value,
) -> Result<(&'v str, &'v str), ComparatorError> {
    match (actual, expected) {
        (Value::String(a), Value::String(e)) => Ok((a, e)),
        _ => Err(ComparatorError::Invalid(format!(
            "expected two strings, got {} and {}",
            type_name(actual),
            type_name(expected)
        ))),
    }
}

fn startswith(actual: &Value, expected: &Value) -> CheckOutcome {
    let (a, e) = both_strings(actual, expected)?;
    if a.starts_with(e) {
        Ok(())
    } else {
        mismatch(format!("\"{a}\" does not start with \"{e}\""))
    }
}

fn endswith(actual: &Value, expected: &Value) -> CheckOutcome {
    let (a, e) = both_strings(actual, expected)?;
    if a.ends_with(e) {
        Ok(())
    } else {
        mismatch(format!("\"{a}\" does not end with \"{e}\""))
    }
}

fn regex_match(actual: &Value, expected: &Value) -> CheckOutcome {
    let (a, pattern) = both_strings(actual, expected)?;
    let re = Regex::new(pattern)
        .map_err(|e| ComparatorError::Invalid(format!("invalid pattern '{pattern}': {e}")))?;
    if re.is_match(a) {
        Ok(())
    } else {
        mismatch(format!("\"{a}\" does not match /{pattern}/"))
    }
}

fn type_match(actual: &Value, expected: &Value) -> CheckOutcome {
    let Value::String(wanted) = expected else {
        return invalid(format!("type name must be a string, got {expected}"));
    };
    let ok = match wanted.to_ascii_lowercase().as_str() {
        "int" | "integer" => actual.is_i64() || actual.is_u64(),
        "float" => actual.is_f64(),
        "number" => actual.is_number(),
        "str" | "string" => actual.is_string(),
        "bool" | "boolean" => actual.is_boolean(),
        "list" | "array" => actual.is_array(),
        "dict" | "object" | "map" => actual.is_object(),
        "null" | "none" => actual.is_null(),
        other => return invalid(format!("unknown type name '{other}'")),
    };
    if ok {
        Ok(())
    } else {
        mismatch(format!("expected type {wanted}, got {}", type_name(actual)))
    }
}

fn is_true(actual: &Value, _: &Value) -> CheckOutcome {
    match actual {
        Value::Bool(true) => Ok(()),
        other => mismatch(format!("expected true, got {other}")),
    }
}

fn is_false(actual: &Value, _: &Value) -> CheckOutcome {
    match actual {
        Value::Bool(false) => Ok(()),
        other => mismatch(format!("expected false, got {other}")),
    }
}

fn is_none(actual: &Value, _: &Value) -> CheckOutcome {
    if actual.is_null() {
        Ok(())
    } else {
        mismatch(format!("expected null, got {actual}"))
    }
}

fn is_not_none(actual: &Value, _: &Value) -> CheckOutcome {
    if actual.is_null() {
        mismatch("expected a non-null value".to_string())
    } else {
        Ok(())
    }
}

fn is_truthy(actual: &Value, _: &Value) -> CheckOutcome {
    if truthy(actual) {
        Ok(())
    } else {
        mismatch(format!("expected a truthy value, got {actual}"))
    }
}

fn is_falsy(actual: &Value, _: &Value) -> CheckOutcome {
    if truthy(actual) {
        mismatch(format!("expected a falsy value, got {actual}"))
    } else {
        Ok(())
    }
}

fn lengths(actual: &Value, expected: &Value) -> Result<(usize, usize), ComparatorError> {
    let len = match actual {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        other => {
            return Err(ComparatorError::Invalid(format!(
                "a {} has no length",
                type_name(other)
            )))
        }
    };
    let wanted = expected
        .as_u64()
        .or_else(|| expected.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| {
            ComparatorError::Invalid(format!(
                "expected length must be a non-negative integer, got {expected}"
            ))
        })?;
    Ok((len, wanted as usize))
}

fn length_cmp(
    actual: &Value,
    expected: &Value,
    op: &str,
    ok: fn(usize, usize) -> bool,
) -> CheckOutcome {
    let (len, wanted) = lengths(actual, expected)?;
    if ok(len, wanted) {
        Ok(())
    } else {
        mismatch(format!("expected length {op} {wanted}, got length {len}"))
    }
}

fn length_equals(a: &Value, e: &Value) -> CheckOutcome {
    length_cmp(a, e, "==", |l, w| l == w)
}

fn length_greater_than(a: &Value, e: &Value) -> CheckOutcome {
    length_cmp(a, e, ">", |l, w| l > w)
}

fn length_greater_or_equals(a: &Value, e: &Value) -> CheckOutcome {
    length_cmp(a, e, ">=", |l, w| l >= w)
}

fn length_less_than(a: &Value, e: &Value) -> CheckOutcome {
    length_cmp(a, e, "<", |l, w| l < w)
}

fn length_less_or_equals(a: &Value, e: &Value) -> CheckOutcome {
    length_cmp(a, e, "<=", |l, w| l <= w)
}

fn records(actual: &Value) -> Result<&Vec<Value>, ComparatorError> {
    match actual {
        Value::Array(items) => Ok(items),
        other => Err(ComparatorError::Invalid(format!(
            "expected a list of records, got {}",
            type_name(other)
        ))),
    }
}

fn field_names(expected: &Value) -> Result<Vec<&str>, ComparatorError> {
    match expected {
        Value::String(s) => Ok(vec![s.as_str()]),
        Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str().ok_or_else(|| {
                    ComparatorError::Invalid(format!("field names must be strings, got {v}"))
                })
            })
            .collect(),
        other => Err(ComparatorError::Invalid(format!(
            "expected a field name or list of names, got {other}"
        ))),
    }
}

fn data_has_fields(actual: &Value, expected: &Value) -> CheckOutcome {
    let fields = field_names(expected)?;
    for (i, record) in records(actual)?.iter().enumerate() {
        let Value::Object(map) = record else {
            return invalid(format!("record {i} is not an object"));
        };
        if let Some(missing) = fields.iter().find(|f| !map.contains_key(**f)) {
            return mismatch(format!("record {i} lacks field '{missing}'"));
        }
    }
    Ok(())
}

fn data_lacks_fields(actual: &Value, expected: &Value) -> CheckOutcome {
    let fields = field_names(expected)?;
    for (i, record) in records(actual)?.iter().enumerate() {
        let Value::Object(map) = record else {
            return invalid(format!("record {i} is not an object"));
        };
        if let Some(present) = fields.iter().find(|f| map.contains_key(**f)) {
            return mismatch(format!("record {i} has field '{present}'"));
        }
    }
    Ok(())
}

fn data_field_equals(actual: &Value, expected: &Value) -> CheckOutcome {
    let Value::Object(wanted) = expected else {
        return invalid(format!("expected a mapping of field values, got {expected}"));
    };
    for (i, record) in records(actual)?.iter().enumerate() {
        let Value::Object(map) = record else {
            return invalid(format!("record {i} is not an object"));
        };
        for (field, value) in wanted {
            match map.get(field) {
                Some(v) if loose_eq(v, value) => {}
                Some(v) => {
                    return mismatch(format!(
                        "record {i} field '{field}': expected {value}, got {v}"
                    ))
                }
                None => return mismatch(format!("record {i} lacks field '{field}'")),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(name: &str, actual: Value, expected: Value) -> CheckOutcome {
        let entry = lookup(name).unwrap_or_else(|| panic!("no comparator {name}"));
        (entry.func)(&actual, &expected)
    }

    fn is_mismatch(outcome: CheckOutcome) -> bool {
        matches!(outcome, Err(ComparatorError::Mismatch(_)))
    }

    fn is_invalid(outcome: CheckOutcome) -> bool {
        matches!(outcome, Err(ComparatorError::Invalid(_)))
    }

    #[test]
    fn test_lookup_by_code_name_and_alias() {
        assert_eq!(lookup("_19length_equals").map(|e| e.name), Some("length_equals"));
        assert_eq!(lookup("length_equals").map(|e| e.code), Some("_19length_equals"));
        assert_eq!(lookup("len_eq").map(|e| e.name), Some("length_equals"));
        assert!(lookup("_99nothing").is_none());
    }

    #[test]
    fn test_codes_are_unique_and_numbered() {
        let list = list_comparators();
        for (i, entry) in list.iter().enumerate() {
            assert!(entry.code.starts_with(&format!("_{:02}", i + 1)), "{}", entry.code);
            assert!(entry.code.ends_with(entry.name));
        }
    }

    #[test]
    fn test_equality() {
        assert!(check("equals", json!(1), json!(1.0)).is_ok());
        assert!(is_mismatch(check("equals", json!("1"), json!(1))));
        assert!(check("not_equals", json!("a"), json!("b")).is_ok());
        assert!(check("string_equals", json!(200), json!("200")).is_ok());
    }

    #[test]
    fn test_ordering_rejects_mixed_types() {
        assert!(check("lt", json!(1), json!(2)).is_ok());
        assert!(is_mismatch(check(">=", json!(1), json!(2))));
        assert!(check("greater_than", json!("b"), json!("a")).is_ok());
        assert!(is_invalid(check("less_than", json!("1"), json!(2))));
    }

    #[test]
    fn test_containment() {
        assert!(check("contains", json!("hello world"), json!("world")).is_ok());
        assert!(check("contains", json!([1, 2]), json!(2)).is_ok());
        assert!(check("contains", json!({"a": 1}), json!("a")).is_ok());
        assert!(is_mismatch(check("not_contains", json!([1, 2]), json!(1))));
        assert!(check("contained_by", json!("b"), json!(["a", "b"])).is_ok());
        assert!(check("not_contained_by", json!("z"), json!(["a", "b"])).is_ok());
        assert!(is_invalid(check("contains", json!(5), json!(5))));
    }

    #[test]
    fn test_string_affixes_and_regex() {
        assert!(check("startswith", json!("us_01"), json!("us_")).is_ok());
        assert!(is_mismatch(check("endswith", json!("us_01"), json!("x"))));
        assert!(is_invalid(check("startswith", json!(1), json!("1"))));
        assert!(check("regex_match", json!("2024-01-02"), json!(r"^\d{4}-\d{2}")).is_ok());
        assert!(is_invalid(check("regex_match", json!("x"), json!("("))));
    }

    #[test]
    fn test_type_and_truthiness() {
        assert!(check("type_match", json!(3), json!("int")).is_ok());
        assert!(is_mismatch(check("type_match", json!(3.5), json!("int"))));
        assert!(is_invalid(check("type_match", json!(3), json!("widget"))));
        assert!(check("is_true", json!(true), Value::Null).is_ok());
        assert!(is_mismatch(check("is_true", json!(1), Value::Null)));
        assert!(check("is_truthy", json!(1), Value::Null).is_ok());
        assert!(check("is_falsy", json!(""), Value::Null).is_ok());
        assert!(check("is_false", json!(false), Value::Null).is_ok());
        assert!(check("is_none", Value::Null, Value::Null).is_ok());
        assert!(is_mismatch(check("is_not_none", Value::Null, Value::Null)));
    }

    #[test]
    fn test_length_comparators() {
        assert!(check("_19length_equals", json!([1, 2, 3]), json!(3)).is_ok());
        let err = check("_19length_equals", json!([1, 2]), json!(3)).unwrap_err();
        assert_eq!(
            err,
            ComparatorError::Mismatch("expected length == 3, got length 2".into())
        );
        assert!(check("len_gt", json!("abc"), json!(2)).is_ok());
        assert!(check("length_less_or_equals", json!({"a": 1}), json!("1")).is_ok());
        assert!(is_invalid(check("length_equals", json!(12), json!(2))));
        assert!(is_invalid(check("length_equals", json!([]), json!(-1))));
    }

    #[test]
    fn test_batch_record_checks() {
        let rows = json!([{"id": 1, "state": "ok"}, {"id": 2, "state": "ok"}]);
        assert!(check("data_has_fields", rows.clone(), json!(["id", "state"])).is_ok());
        assert!(is_mismatch(check("data_has_fields", rows.clone(), json!("name"))));
        assert!(check("data_lacks_fields", rows.clone(), json!("name")).is_ok());
        assert!(check("data_field_equals", rows.clone(), json!({"state": "ok"})).is_ok());
        assert!(is_mismatch(check("data_field_equals", rows, json!({"id": 1}))));
        assert!(is_invalid(check("data_has_fields", json!({"id": 1}), json!("id"))));
    }
}
