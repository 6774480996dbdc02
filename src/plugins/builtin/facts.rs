//! Built-in facts

use crate::almanac::Almanac;
use crate::fact::Fact;
use crate::pattern::{compile_patterns, find_matches};
use serde_json::{json, Value};

/// Runtime fact holding the `FileData` of every file in the run
pub const GLOBAL_FILE_METADATA: &str = "globalFileMetadata";

pub fn facts() -> Vec<Fact> {
    vec![
        Fact::new("fileData", file_data).with_priority(1),
        Fact::new("fileList", file_list).global().with_priority(1),
    ]
}

/// The current file; `params.checkPattern` adds `patternMatches`
fn file_data(params: &Value, almanac: &Almanac) -> anyhow::Result<Value> {
    let file = almanac.file();
    let mut value = serde_json::to_value(file)?;

    if let Some(check) = params.get("checkPattern") {
        let patterns = compile_patterns(check)?;
        let matches = find_matches(&file.file_content, &patterns);
        value["patternMatches"] = serde_json::to_value(matches)?;
    }

    Ok(value)
}

/// Sorted paths of every file in the run, optionally filtered by
/// `params.pattern`
fn file_list(params: &Value, almanac: &Almanac) -> anyhow::Result<Value> {
    let metadata = almanac
        .fact_value(GLOBAL_FILE_METADATA, &Value::Null)
        .unwrap_or(Value::Null);

    let mut paths: Vec<&str> = metadata
        .as_array()
        .map(|files| {
            files
                .iter()
                .filter_map(|f| f.get("filePath").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if let Some(pattern) = params.get("pattern") {
        let patterns = compile_patterns(pattern)?;
        paths.retain(|p| patterns.iter().any(|re| re.is_match(p)));
    }

    paths.sort_unstable();
    Ok(json!(paths))
}
