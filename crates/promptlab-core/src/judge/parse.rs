//! Tolerant parsing of judge replies.
//!
//! Models answer in many shapes: a JSON object, JSON wrapped in prose or a
//! code fence, a bare `PASS`, or a sentence such as "this does not pass".
//! These functions recover a verdict or a rewrite from any of them and report
//! a [`ReplyParseError`] only when nothing usable is present.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use serde_yaml::Value as YamlValue;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyParseError {
    #[error("empty reply")]
    Empty,

    #[error("no pass/fail verdict found in reply")]
    NoVerdict,

    #[error("no rewrite found in reply")]
    NoRewrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVerdict {
    pub passed: bool,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposedRewrite {
    /// Field the judge says it rewrote. May differ from the requested one.
    pub field: String,
    pub value: YamlValue,
    pub rationale: Option<String>,
}

const FEEDBACK_KEYS: [&str; 5] = ["feedback", "explanation", "reason", "rationale", "comment"];

fn verdict_token_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\bnot\s+|n't\s+)?\b(pass(?:ed|es)?|fail(?:ed|s|ure)?)\b").ok()
    })
    .as_ref()
}

/// Recover a pass/fail verdict from a judge reply.
pub fn parse_verdict(reply: &str) -> Result<ParsedVerdict, ReplyParseError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(ReplyParseError::Empty);
    }

    if let Some(obj) = extract_json_object(trimmed) {
        if let Some(passed) = verdict_from_object(&obj) {
            let feedback = FEEDBACK_KEYS
                .iter()
                .find_map(|k| obj.get(*k).and_then(JsonValue::as_str))
                .unwrap_or_default()
                .trim()
                .to_string();
            return Ok(ParsedVerdict { passed, feedback });
        }
    }

    if let Some(passed) = classify_word(trimmed.trim_matches(|c: char| !c.is_alphanumeric())) {
        return Ok(ParsedVerdict {
            passed,
            feedback: String::new(),
        });
    }

    let re = verdict_token_regex().ok_or(ReplyParseError::NoVerdict)?;
    let caps = re.captures(trimmed).ok_or(ReplyParseError::NoVerdict)?;
    let negated = caps.get(1).is_some();
    let positive = caps
        .get(2)
        .map(|m| m.as_str().to_ascii_lowercase().starts_with("pass"))
        .ok_or(ReplyParseError::NoVerdict)?;

    Ok(ParsedVerdict {
        passed: positive != negated,
        feedback: trimmed.to_string(),
    })
}

/// Recover a rewrite of `requested_field` from a judge reply.
pub fn parse_rewrite(
    reply: &str,
    requested_field: &str,
) -> Result<ProposedRewrite, ReplyParseError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(ReplyParseError::Empty);
    }

    if let Some(obj) = extract_json_object(trimmed) {
        let rationale = FEEDBACK_KEYS
            .iter()
            .filter(|k| **k != "feedback")
            .find_map(|k| obj.get(*k).and_then(JsonValue::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        if let Some(value) = obj.get("value") {
            let field = obj
                .get("field")
                .and_then(JsonValue::as_str)
                .unwrap_or(requested_field)
                .to_string();
            let value = json_to_yaml(value).ok_or(ReplyParseError::NoRewrite)?;
            return Ok(ProposedRewrite {
                field,
                value,
                rationale,
            });
        }
        if let Some(value) = obj.get(requested_field) {
            let value = json_to_yaml(value).ok_or(ReplyParseError::NoRewrite)?;
            return Ok(ProposedRewrite {
                field: requested_field.to_string(),
                value,
                rationale,
            });
        }
        return Err(ReplyParseError::NoRewrite);
    }

    if let Some(block) = fenced_block(trimmed) {
        let parsed: YamlValue =
            serde_yaml::from_str(block).unwrap_or_else(|_| YamlValue::String(block.to_string()));
        let value = match parsed {
            YamlValue::Mapping(ref m) if m.len() == 1 && m.contains_key(requested_field) => {
                m.get(requested_field).cloned().unwrap_or(YamlValue::Null)
            }
            other => other,
        };
        if value.is_null() {
            return Err(ReplyParseError::NoRewrite);
        }
        return Ok(ProposedRewrite {
            field: requested_field.to_string(),
            value,
            rationale: None,
        });
    }

    Ok(ProposedRewrite {
        field: requested_field.to_string(),
        value: YamlValue::String(trimmed.to_string()),
        rationale: None,
    })
}

fn verdict_from_object(obj: &Map<String, JsonValue>) -> Option<bool> {
    for key in ["passed", "pass"] {
        if let Some(v) = obj.get(key) {
            if let Some(b) = verdict_from_value(v) {
                return Some(b);
            }
        }
    }
    for key in ["verdict", "result", "decision"] {
        if let Some(b) = obj.get(key).and_then(verdict_from_value) {
            return Some(b);
        }
    }
    obj.get("score")
        .and_then(JsonValue::as_f64)
        .map(|score| score >= 0.5)
}

fn verdict_from_value(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) => classify_word(s.trim()),
        JsonValue::Number(n) => n.as_f64().map(|x| x >= 0.5),
        _ => None,
    }
}

fn classify_word(word: &str) -> Option<bool> {
    match word.to_ascii_lowercase().as_str() {
        "pass" | "passed" | "passes" | "true" | "yes" | "ok" => Some(true),
        "fail" | "failed" | "fails" | "failure" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn json_to_yaml(value: &JsonValue) -> Option<YamlValue> {
    match value {
        JsonValue::Null => None,
        other => serde_yaml::to_value(other).ok(),
    }
}

/// First balanced `{...}` block that parses as a JSON object.
fn extract_json_object(text: &str) -> Option<Map<String, JsonValue>> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = matching_brace(bytes, open) {
            if let Ok(JsonValue::Object(map)) = serde_json::from_str(&text[open..=close]) {
                return Some(map);
            }
        }
        start = open + 1;
    }
    None
}

fn matching_brace(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Body of the first ``` fenced block, without the language tag.
fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n')? + 1;
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_corpus() {
        let cases: &[(&str, bool)] = &[
            ("PASS", true),
            ("fail", false),
            ("Passed.", true),
            (r#"{"passed": true, "feedback": "clear"}"#, true),
            (r#"{"passed": false, "feedback": "vague goal"}"#, false),
            (r#"{"verdict": "FAIL", "reason": "no schema"}"#, false),
            (r#"{"pass": "yes"}"#, true),
            (r#"{"score": 0.8}"#, true),
            (r#"{"score": 0.2, "explanation": "weak"}"#, false),
            ("Here is my assessment:\n```json\n{\"passed\": true}\n```", true),
            ("Verdict: PASS - the role is explicit.", true),
            ("The prompt does not pass this criterion.", false),
            ("It doesn't pass because the goal is vague.", false),
            ("This clearly fails the check.", false),
            ("Result: FAILED", false),
            ("yes", true),
        ];
        for (reply, expected) in cases {
            let v = parse_verdict(reply).unwrap_or_else(|e| panic!("{reply:?}: {e}"));
            assert_eq!(v.passed, *expected, "reply {reply:?}");
        }
    }

    #[test]
    fn test_verdict_feedback_extraction() {
        let v = parse_verdict(r#"noise {"passed": false, "feedback": " add a schema "} trailing"#)
            .expect("parse");
        assert!(!v.passed);
        assert_eq!(v.feedback, "add a schema");

        let v = parse_verdict("FAIL: objective is vague").expect("parse");
        assert_eq!(v.feedback, "FAIL: objective is vague");
    }

    #[test]
    fn test_verdict_unrecoverable() {
        assert_eq!(parse_verdict("   "), Err(ReplyParseError::Empty));
        assert_eq!(
            parse_verdict("I am not sure what you mean."),
            Err(ReplyParseError::NoVerdict)
        );
        assert_eq!(
            parse_verdict(r#"{"thoughts": "hmm"}"#),
            Err(ReplyParseError::NoVerdict)
        );
        assert_eq!(parse_verdict("bypass the compass"), Err(ReplyParseError::NoVerdict));
    }

    #[test]
    fn test_braces_inside_strings() {
        let v = parse_verdict(r#"{"feedback": "use {placeholders}", "passed": true}"#)
            .expect("parse");
        assert!(v.passed);
        assert_eq!(v.feedback, "use {placeholders}");
    }

    #[test]
    fn test_rewrite_from_json() {
        let r = parse_rewrite(
            r#"{"field": "objective", "value": "Score leads 0-100", "rationale": "measurable"}"#,
            "objective",
        )
        .expect("parse");
        assert_eq!(r.field, "objective");
        assert_eq!(r.value, YamlValue::String("Score leads 0-100".into()));
        assert_eq!(r.rationale.as_deref(), Some("measurable"));
    }

    #[test]
    fn test_rewrite_keyed_by_field_name() {
        let r = parse_rewrite(r#"{"constraints": ["max 100 words", "no PII"]}"#, "constraints")
            .expect("parse");
        assert!(r.value.is_sequence());
        assert_eq!(r.rationale, None);
    }

    #[test]
    fn test_rewrite_from_fenced_yaml() {
        let reply = "Sure:\n```yaml\noutput_format:\n  type: json\n  fields: [name, score]\n```\n";
        let r = parse_rewrite(reply, "output_format").expect("parse");
        assert_eq!(r.field, "output_format");
        assert!(r.value.is_mapping());
        assert_eq!(r.value.get("type"), Some(&YamlValue::String("json".into())));
    }

    #[test]
    fn test_rewrite_plain_text_and_failures() {
        let r = parse_rewrite("  You are a senior B2B analyst.  ", "role").expect("parse");
        assert_eq!(r.value, YamlValue::String("You are a senior B2B analyst.".into()));

        assert_eq!(parse_rewrite("", "role"), Err(ReplyParseError::Empty));
        assert_eq!(
            parse_rewrite(r#"{"note": "cannot help"}"#, "role"),
            Err(ReplyParseError::NoRewrite)
        );
        assert_eq!(
            parse_rewrite(r#"{"value": null}"#, "role"),
            Err(ReplyParseError::NoRewrite)
        );
    }
}
