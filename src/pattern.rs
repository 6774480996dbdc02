//! Line-oriented regex matching shared by the built-in and manifest facts

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One matching line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    /// 1-based line number
    pub line: usize,
    /// Trimmed line text
    pub text: String,
    /// Pattern that matched
    pub pattern: String,
}

/// Compile a pattern value: a string or an array of strings
pub fn compile_patterns(value: &Value) -> Result<Vec<Regex>, regex::Error> {
    let sources: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    sources.into_iter().map(Regex::new).collect()
}

/// Every (line, pattern) pair where `pattern` matches the line
pub fn find_matches(content: &str, patterns: &[Regex]) -> Vec<PatternMatch> {
    let mut matches = Vec::new();
    for (index, line) in content.lines().enumerate() {
        for pattern in patterns {
            if pattern.is_match(line) {
                matches.push(PatternMatch {
                    line: index + 1,
                    text: line.trim().to_string(),
                    pattern: pattern.as_str().to_string(),
                });
            }
        }
    }
    matches
}
