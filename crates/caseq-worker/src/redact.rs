//! PII scrubbing and the payload allowlist.
//!
//! Everything that leaves the worker on a failure path (logs, the
//! diagnostics sink, dead-letter records) passes through these functions.
//!
//! Category tags are part of the audit trail and must stay stable. New
//! categories are appended to [`PATTERNS`]; existing entries keep their tag.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

/// Payload fields that may leave the worker. Anything else is dropped.
pub const PAYLOAD_ALLOWLIST: [&str; 9] = [
    "userId",
    "caseId",
    "documentId",
    "formId",
    "formType",
    "documentType",
    "provider",
    "emailType",
    "templateId",
];

struct Pattern {
    regex: Regex,
    replacement: &'static str,
}

/// Sensitive patterns, applied in order.
static PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        // USCIS receipt numbers: service centre code + 10 digits
        Pattern {
            regex: Regex::new(
                r"\b(?i:EAC|WAC|LIN|SRC|NBC|MSC|IOE|YSC|TSC|VSC|NSC|CSC)[- ]?\d{10}\b",
            )
            .unwrap(),
            replacement: "[RECEIPT#]",
        },
        // Travel documents, only when introduced by the keyword
        Pattern {
            regex: Regex::new(
                r"(?i)\b(passport(?:\s+(?:no\.?|num|number|#))?\s*[:#]?\s*)[A-Z]{0,2}\d{6,9}\b",
            )
            .unwrap(),
            replacement: "${1}[PASSPORT]",
        },
        // Alien registration numbers: A + 8 or 9 digits
        Pattern {
            regex: Regex::new(r"(?i)\bA[- ]?\d{3}[- ]?\d{3}[- ]?\d{2,3}\b").unwrap(),
            replacement: "[A-NUM]",
        },
        Pattern {
            regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b|\b\d{3} \d{2} \d{4}\b").unwrap(),
            replacement: "[SSN]",
        },
        Pattern {
            regex: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            replacement: "[EMAIL]",
        },
    ]
});

fn scrub_once(input: &str) -> Cow<'_, str> {
    let mut text = Cow::Borrowed(input);
    for pattern in PATTERNS.iter() {
        let replaced = match pattern.regex.replace_all(&text, pattern.replacement) {
            Cow::Owned(replaced) => Some(replaced),
            Cow::Borrowed(_) => None,
        };
        if let Some(replaced) = replaced {
            text = Cow::Owned(replaced);
        }
    }
    text
}

/// Replace sensitive substrings with their category tag.
///
/// Unmatched text passes through unchanged. A replacement can expose a new
/// word boundary next to a pattern an earlier pass skipped, so passes repeat
/// until nothing changes. Every replacement removes digits or an `@` and tags
/// contain neither, so this terminates and `scrub(scrub(x)) == scrub(x)`.
pub fn scrub(input: &str) -> String {
    let mut current = match scrub_once(input) {
        Cow::Borrowed(unchanged) => return unchanged.to_string(),
        Cow::Owned(changed) => changed,
    };

    loop {
        let next = match scrub_once(&current) {
            Cow::Borrowed(_) => None,
            Cow::Owned(changed) => Some(changed),
        };
        match next {
            Some(changed) => current = changed,
            None => return current,
        }
    }
}

/// Scrub every string leaf of a JSON value. Keys are left as they are.
pub fn scrub_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(scrub(s)),
        Value::Array(items) => Value::Array(items.iter().map(scrub_value).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), scrub_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Project a payload down to allowlisted, scalar fields.
///
/// Default-deny: unknown keys are dropped, and so are allowlisted keys whose
/// value is an object or array. Kept strings are scrubbed. A payload that is
/// not an object yields an empty object.
pub fn filter_payload(payload: &Value) -> Value {
    let mut filtered = Map::new();

    if let Value::Object(fields) = payload {
        for key in PAYLOAD_ALLOWLIST {
            match fields.get(key) {
                Some(value @ (Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null)) => {
                    filtered.insert(key.to_string(), scrub_value(value));
                }
                _ => {}
            }
        }
    }

    Value::Object(filtered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_scrub_categories() {
        assert_eq!(scrub("123-45-6789 invalid"), "[SSN] invalid");
        assert_eq!(scrub("ssn 123 45 6789"), "ssn [SSN]");
        assert_eq!(scrub("file A123456789 missing"), "file [A-NUM] missing");
        assert_eq!(scrub("file A-123-456-78 missing"), "file [A-NUM] missing");
        assert_eq!(scrub("receipt EAC2190012345 pending"), "receipt [RECEIPT#] pending");
        assert_eq!(scrub("Passport No. X12345678 expired"), "Passport No. [PASSPORT] expired");
        assert_eq!(scrub("passport: 987654321"), "passport: [PASSPORT]");
        assert_eq!(scrub("bounced for jane.doe@example.com"), "bounced for [EMAIL]");
    }

    #[test]
    fn test_unmatched_text_passes_through() {
        let text = "Anthropic returned 529 overloaded after 12000ms";
        assert_eq!(scrub(text), text);
        assert_eq!(scrub(""), "");
    }

    #[test]
    fn test_passport_requires_keyword() {
        // A bare 9-digit number is not classified as a travel document.
        assert_eq!(scrub("order 123456789"), "order 123456789");
    }

    #[test]
    fn test_scrub_value_nested() {
        let value = json!({
            "message": "SSN 123-45-6789",
            "details": ["A12345678", 42, {"note": "EAC2190012345"}]
        });
        let scrubbed = scrub_value(&value);
        assert_eq!(scrubbed["message"], "SSN [SSN]");
        assert_eq!(scrubbed["details"][0], "[A-NUM]");
        assert_eq!(scrubbed["details"][1], 42);
        assert_eq!(scrubbed["details"][2]["note"], "[RECEIPT#]");
    }

    #[test]
    fn test_filter_payload_scenario() {
        let payload = json!({"userId": "u1", "ssn": "123-45-6789", "documentId": "d1"});
        let filtered = filter_payload(&payload);
        assert_eq!(filtered, json!({"userId": "u1", "documentId": "d1"}));
    }

    #[test]
    fn test_filter_payload_drops_nested_and_scrubs_strings() {
        let payload = json!({
            "caseId": {"nested": "value"},
            "formType": "I-130 for 123-45-6789",
            "provider": "anthropic",
            "storagePath": "users/u1/passport.pdf"
        });
        let filtered = filter_payload(&payload);
        assert_eq!(filtered, json!({"formType": "I-130 for [SSN]", "provider": "anthropic"}));
    }

    #[test]
    fn test_filter_non_object_payload() {
        assert_eq!(filter_payload(&json!("123-45-6789")), json!({}));
        assert_eq!(filter_payload(&json!([1, 2])), json!({}));
    }

    fn fragment() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("123-45-6789".to_string()),
            Just("passport ".to_string()),
            Just("no. ".to_string()),
            Just("A".to_string()),
            Just("EAC".to_string()),
            Just("@".to_string()),
            Just("x.co".to_string()),
            Just("-".to_string()),
            Just(" ".to_string()),
            "[0-9]{1,10}",
            "[a-zA-Z]{1,6}",
        ]
    }

    proptest! {
        #[test]
        fn scrub_is_idempotent(input in ".*") {
            let once = scrub(&input);
            prop_assert_eq!(scrub(&once), once);
        }

        #[test]
        fn scrub_is_idempotent_on_near_misses(parts in prop::collection::vec(fragment(), 0..16)) {
            let input = parts.concat();
            let once = scrub(&input);
            prop_assert_eq!(scrub(&once), once);
        }

        #[test]
        fn filter_never_keeps_unlisted_keys(key in "[a-zA-Z_]{1,16}", value in ".*") {
            prop_assume!(!PAYLOAD_ALLOWLIST.contains(&key.as_str()));
            let payload = json!({ key.clone(): value, "userId": "u1" });
            let filtered = filter_payload(&payload);
            prop_assert!(filtered.get(&key).is_none());
            prop_assert_eq!(filtered.get("userId"), Some(&json!("u1")));
        }
    }
}
