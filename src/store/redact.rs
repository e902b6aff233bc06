//! Secret scrubbing for persisted payloads

use serde_json::Value;

pub const REDACTED: &str = "[redacted]";

const SECRET_SUFFIXES: [&str; 5] = ["apikey", "secret", "password", "token", "authorization"];

/// Whether an object key names something that must never hit disk.
///
/// Matching ignores case, `_` and `-`, and accepts prefixes, so
/// `OPENROUTER_API_KEY` and `access-token` both count but `tokens_in` does not.
pub fn is_secret_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    SECRET_SUFFIXES.iter().any(|s| normalized.ends_with(s))
}

/// Replace every secret-named value, at any depth, with [`REDACTED`].
/// Returns how many values were replaced.
pub fn redact(value: &mut Value) -> usize {
    match value {
        Value::Object(map) => {
            let mut count = 0;
            for (key, v) in map.iter_mut() {
                if is_secret_key(key) {
                    if v.as_str() != Some(REDACTED) {
                        *v = Value::String(REDACTED.to_string());
                    }
                    count += 1;
                } else {
                    count += redact(v);
                }
            }
            count
        }
        Value::Array(items) => items.iter_mut().map(redact).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secret_keys() {
        for key in ["api_key", "apiKey", "OPENROUTER_API_KEY", "secret", "client-secret", "password", "token", "access_token", "Authorization"] {
            assert!(is_secret_key(key), "{}", key);
        }
        for key in ["tokens_in", "tokens_out", "id", "author", "keys"] {
            assert!(!is_secret_key(key), "{}", key);
        }
    }

    #[test]
    fn test_redact_nested() {
        let mut payload = json!({
            "unit": "x.rb",
            "provider": {"api_key": "sk-live", "model": "m"},
            "headers": [{"Authorization": "Bearer sk-live"}],
            "usage": {"tokens_in": 3}
        });
        assert_eq!(redact(&mut payload), 2);
        assert_eq!(payload["provider"]["api_key"], REDACTED);
        assert_eq!(payload["provider"]["model"], "m");
        assert_eq!(payload["headers"][0]["Authorization"], REDACTED);
        assert_eq!(payload["usage"]["tokens_in"], 3);
        assert!(!payload.to_string().contains("sk-live"));
    }
}
