//! External task-id codec.
//!
//! Externally a task id may be exposed as `t1.<provider>.<executor>.<raw>` so
//! intermediaries can route on provider/executor without a lookup. Decoding
//! accepts the structured form, a bare 32-character hex id (lower-cased), or
//! any other string unchanged.

const PREFIX: &str = "t1.";

pub fn encode(task_id: &str, provider: &str, executor_id: &str) -> String {
    format!("{PREFIX}{provider}.{executor_id}.{task_id}")
}

pub fn decode(external: &str) -> String {
    if let Some(rest) = external.strip_prefix(PREFIX) {
        let mut parts = rest.splitn(3, '.');
        if let (Some(_provider), Some(_executor), Some(raw)) =
            (parts.next(), parts.next(), parts.next())
        {
            return raw.to_string();
        }
        return external.to_string();
    }

    if external.len() == 32 && external.chars().all(|c| c.is_ascii_hexdigit()) {
        return external.to_lowercase();
    }

    external.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        assert_eq!(decode(&encode("abc123", "p", "e")), "abc123");
    }

    #[test]
    fn test_raw_id_with_dots_survives() {
        assert_eq!(decode(&encode("a.b.c", "comfyui", "ex-1")), "a.b.c");
    }

    #[test]
    fn test_bare_hex_is_lowercased() {
        let hex = "0123456789ABCDEF0123456789ABCDEF";
        assert_eq!(decode(hex), hex.to_lowercase());
    }

    #[test]
    fn test_non_matching_string_passes_through() {
        assert_eq!(decode("some-task-id"), "some-task-id");
        assert_eq!(decode("t1.incomplete"), "t1.incomplete");
    }
}
