//! Built-in comparison operators

use crate::fact::Operator;
use crate::pattern::compile_patterns;
use regex::Regex;
use serde_json::Value;

/// All built-in operators
pub fn operators() -> Vec<Operator> {
    vec![
        Operator::new("equal", |a, b| a == b),
        Operator::new("notEqual", |a, b| a != b),
        Operator::new("in", |a, b| is_in(a, b)),
        Operator::new("notIn", |a, b| !is_in(a, b)),
        Operator::new("contains", contains),
        Operator::new("doesNotContain", |a, b| !contains(a, b)),
        Operator::new("lessThan", |a, b| compare(a, b, |x, y| x < y)),
        Operator::new("lessThanInclusive", |a, b| compare(a, b, |x, y| x <= y)),
        Operator::new("greaterThan", |a, b| compare(a, b, |x, y| x > y)),
        Operator::new("greaterThanInclusive", |a, b| compare(a, b, |x, y| x >= y)),
        Operator::new("regexMatch", regex_match),
        Operator::new("fileContains", file_contains),
    ]
}

fn is_in(value: &Value, expected: &Value) -> bool {
    expected
        .as_array()
        .is_some_and(|items| items.contains(value))
}

fn contains(value: &Value, expected: &Value) -> bool {
    match (value, expected) {
        (Value::Array(items), _) => items.contains(expected),
        (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
        _ => false,
    }
}

fn compare(value: &Value, expected: &Value, op: fn(f64, f64) -> bool) -> bool {
    match (value.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn regex_match(value: &Value, expected: &Value) -> bool {
    let (Some(text), Some(pattern)) = (value.as_str(), expected.as_str()) else {
        return false;
    };
    Regex::new(pattern).is_ok_and(|re| re.is_match(text))
}

/// Content check against a `fileData` value.
///
/// With a boolean, compares "has pattern matches" to it; with a pattern or
/// pattern list, searches the content directly.
fn file_contains(value: &Value, expected: &Value) -> bool {
    if let Value::Bool(wanted) = expected {
        let found = value
            .get("patternMatches")
            .and_then(Value::as_array)
            .is_some_and(|m| !m.is_empty());
        return found == *wanted;
    }

    let content = match value {
        Value::String(s) => s.as_str(),
        _ => match value.get("fileContent").and_then(Value::as_str) {
            Some(content) => content,
            None => return false,
        },
    };

    compile_patterns(expected)
        .map(|patterns| patterns.iter().any(|p| p.is_match(content)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn apply(name: &str, a: Value, b: Value) -> bool {
        let operator = operators()
            .into_iter()
            .find(|o| o.name() == name)
            .unwrap();
        operator.evaluate(&a, &b)
    }

    #[test]
    fn test_equality() {
        assert!(apply("equal", json!("a"), json!("a")));
        assert!(!apply("equal", json!(1), json!("1")));
        assert!(apply("notEqual", json!(1), json!(2)));
    }

    #[test]
    fn test_membership() {
        assert!(apply("in", json!("b"), json!(["a", "b"])));
        assert!(!apply("in", json!("c"), json!(["a", "b"])));
        assert!(!apply("in", json!("a"), json!("a")));
        assert!(apply("notIn", json!("c"), json!(["a", "b"])));
        assert!(apply("contains", json!(["x", "y"]), json!("y")));
        assert!(apply("contains", json!("hello world"), json!("world")));
        assert!(apply("doesNotContain", json!(["x"]), json!("y")));
    }

    #[test]
    fn test_numeric_comparisons() {
        assert!(apply("lessThan", json!(1), json!(2)));
        assert!(!apply("lessThan", json!(2), json!(2)));
        assert!(apply("lessThanInclusive", json!(2), json!(2)));
        assert!(apply("greaterThan", json!(3.5), json!(3)));
        assert!(apply("greaterThanInclusive", json!(3), json!(3)));
        assert!(!apply("greaterThan", json!("3"), json!(1)));
    }

    #[test]
    fn test_regex_match() {
        assert!(apply("regexMatch", json!("react-17"), json!("^react-\\d+$")));
        assert!(!apply("regexMatch", json!("vue"), json!("^react")));
        assert!(!apply("regexMatch", json!("x"), json!("(")));
    }

    #[test]
    fn test_file_contains_with_patterns() {
        let data = json!({ "fileContent": "const apiKey = 'abc';" });
        assert!(apply("fileContains", data.clone(), json!("apiKey")));
        assert!(apply("fileContains", data.clone(), json!(["nope", "api[A-Z]ey"])));
        assert!(!apply("fileContains", data, json!("password")));
        assert!(apply("fileContains", json!("raw text"), json!("raw")));
    }

    #[test]
    fn test_file_contains_with_bool() {
        let hit = json!({ "patternMatches": [{ "line": 1, "text": "x", "pattern": "x" }] });
        let miss = json!({ "patternMatches": [] });
        assert!(apply("fileContains", hit.clone(), json!(true)));
        assert!(!apply("fileContains", hit, json!(false)));
        assert!(apply("fileContains", miss.clone(), json!(false)));
        assert!(!apply("fileContains", miss, json!(true)));
        assert!(!apply("fileContains", json!({}), json!(true)));
    }
}
