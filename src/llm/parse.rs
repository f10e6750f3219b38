//! JSON extraction and bounded repair for model output
//!
//! Text-mode models wrap their JSON in prose, markdown fences, or emit it
//! with small syntax defects. Extraction tries, in order: a fenced ```json
//! block, then the first balanced `{...}` span. Repair is bounded to two
//! passes (trailing commas, unbalanced braces) so malformed output fails
//! fast instead of looping.

use serde_json::Value;

/// Parse a JSON object out of free-form model text.
pub fn parse_json_lenient(text: &str) -> Result<Value, String> {
    let candidate = extract_candidate(text);

    match serde_json::from_str::<Value>(&candidate) {
        Ok(value) if value.is_object() => return Ok(value),
        Ok(other) => return Err(format!("expected a JSON object, got {other}")),
        Err(_) => {}
    }

    // Two bounded repair attempts.
    let mut repaired = candidate;
    for _ in 0..2 {
        repaired = repair_pass(&repaired);
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            if value.is_object() {
                return Ok(value);
            }
        }
    }

    Err("no parseable JSON object in response".to_string())
}

/// Best JSON candidate inside the text.
fn extract_candidate(text: &str) -> String {
    if let Some(block) = fenced_block(text) {
        return block;
    }
    if let Some(span) = balanced_braces(text) {
        return span;
    }
    text.trim().to_string()
}

/// Contents of the first ```json (or bare ```) fence.
fn fenced_block(text: &str) -> Option<String> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let end = body.find("```")?;
    let block = body[..end].trim();
    if block.starts_with('{') {
        Some(block.to_string())
    } else {
        None
    }
}

/// First balanced `{...}` span, quote-aware.
fn balanced_braces(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// One repair pass: drop trailing commas, close unbalanced braces.
fn repair_pass(candidate: &str) -> String {
    let mut out = String::with_capacity(candidate.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = candidate.chars().collect();

    for (i, &c) in chars.iter().enumerate() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = !in_string;
                out.push(c);
            }
            ',' if !in_string => {
                // Trailing comma: next non-whitespace is a closer.
                let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    // Balance braces.
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    for c in out.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => depth -= 1,
            _ => {}
        }
    }
    for _ in 0..depth.max(0) {
        out.push('}');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_plain_json() {
        let value = parse_json_lenient(r#"{"worker": "shell"}"#).unwrap();
        assert_eq!(value["worker"], json!("shell"));
    }

    #[test]
    fn parses_fenced_block() {
        let text = "Here is my plan:\n```json\n{\"worker\": \"chat\"}\n```\nDone.";
        let value = parse_json_lenient(text).unwrap();
        assert_eq!(value["worker"], json!("chat"));
    }

    #[test]
    fn parses_embedded_object() {
        let text = "Sure! {\"worker\": \"shell\", \"args\": {\"command\": \"ls\"}} hope that helps";
        let value = parse_json_lenient(text).unwrap();
        assert_eq!(value["args"]["command"], json!("ls"));
    }

    #[test]
    fn repairs_trailing_comma() {
        let value = parse_json_lenient(r#"{"worker": "shell", "action": "x",}"#).unwrap();
        assert_eq!(value["action"], json!("x"));
    }

    #[test]
    fn repairs_missing_close_brace() {
        let value = parse_json_lenient(r#"{"worker": "shell", "args": {"command": "ls""#);
        // Two passes close both braces.
        assert!(value.is_ok(), "{value:?}");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"{"message": "use {curly} braces"}"#;
        let value = parse_json_lenient(text).unwrap();
        assert_eq!(value["message"], json!("use {curly} braces"));
    }

    #[test]
    fn gives_up_on_garbage() {
        assert!(parse_json_lenient("no json here at all").is_err());
    }

    #[test]
    fn rejects_non_object_json() {
        assert!(parse_json_lenient("[1, 2, 3]").is_err());
    }
}
