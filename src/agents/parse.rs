//! Lenient JSON extraction from model responses.
//!
//! Models wrap their output in prose and markdown more often than not. The
//! extractor tries, in order: the first ```json fence, then the substring
//! from the first `{` to the last `}`. It never errors; a `None` sends the
//! agent down its fallback path.

use serde_json::Value;

/// Extract the most plausible JSON object from a raw model response.
pub fn extract_json(raw: &str) -> Option<Value> {
    if let Some(fenced) = extract_fenced(raw)
        && let Ok(value) = serde_json::from_str::<Value>(fenced.trim())
    {
        return Some(value);
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&raw[start..=end]).ok()
}

fn extract_fenced(raw: &str) -> Option<&str> {
    let open = raw.find("```json")?;
    let body = &raw[open + "```json".len()..];
    let close = body.find("```")?;
    Some(&body[..close])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_json_fence() {
        let raw = "Sure, here you go:\n```json\n{\"genre\": \"fantasy\"}\n```\nanything else?";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["genre"], "fantasy");
    }

    #[test]
    fn falls_back_to_brace_span() {
        let raw = "The result is {\"scenes\": [1, 2]} as requested.";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["scenes"][1], 2);
    }

    #[test]
    fn prefers_fence_over_surrounding_braces() {
        let raw = "{not json}\n```json\n{\"ok\": true}\n```";
        let value = extract_json(raw).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn broken_fence_still_tries_brace_span() {
        // Fence contains invalid JSON, but the brace span covering it parses.
        let raw = "```json\n{\"ok\": true}\nextra```";
        // The fenced body "{\"ok\": true}\nextra" fails; brace span "{\"ok\": true}" parses.
        let value = extract_json(raw).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn hopeless_input_yields_none() {
        assert!(extract_json("no json here at all").is_none());
        assert!(extract_json("").is_none());
        assert!(extract_json("} backwards {").is_none());
    }
}
