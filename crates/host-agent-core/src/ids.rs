//! Identifier helpers for values that end up in file names.

/// Maximum length of an identifier used as a file name.
pub const MAX_ID_LEN: usize = 200;

fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Map arbitrary text onto the identifier alphabet `[A-Za-z0-9._-]`.
///
/// Other characters become `_`. A result that is empty or starts with a
/// dot is prefixed with `_`, so it never names `.`, `..` or a hidden file.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .take(MAX_ID_LEN)
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with('.') {
        out.insert(0, '_');
    }
    out
}

/// Whether `id` is safe to use directly as a file name.
#[must_use]
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN + 32
        && !id.starts_with('.')
        && id.chars().all(is_safe_char)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_separators() {
        assert_eq!(sanitize_component("com.example/Foo$Bar"), "com.example_Foo_Bar");
        assert_eq!(sanitize_component(".."), "_..");
        assert_eq!(sanitize_component(""), "_");
        assert_eq!(sanitize_component(".hidden"), "_.hidden");
        assert!(is_safe_id(&format!("{}_1", sanitize_component(".hidden"))));
    }

    #[test]
    fn test_safe_id() {
        assert!(is_safe_id("manual_1700000000000"));
        assert!(is_safe_id("before_mutation_com.example.Foo_1"));
        assert!(!is_safe_id("../etc/passwd"));
        assert!(!is_safe_id("a/b"));
        assert!(!is_safe_id(".hidden"));
        assert!(!is_safe_id(""));
    }
}
