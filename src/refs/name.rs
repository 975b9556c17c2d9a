//! Refname validation, per `git-check-ref-format` rules.
//!
//! A valid name is slash-separated components where no component is empty,
//! starts or ends with `.`, or ends with `.lock`; the name contains no
//! `..`, no `@{`, no control bytes, none of ` ~^:?*[\`, and does not end
//! with `/` or `.`. The single name `HEAD` (and other all-caps top-level
//! pseudo-refs like `FETCH_HEAD`) is allowed without a slash.

/// True when `name` is a valid refname.
#[must_use]
pub fn is_valid(name: &str) -> bool {
    if name.is_empty() || name == "@" {
        return false;
    }
    // Top-level pseudo-refs: HEAD, FETCH_HEAD, ORIG_HEAD, MERGE_HEAD...
    if !name.contains('/') {
        return name
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b == b'_');
    }

    let bytes = name.as_bytes();
    if bytes.ends_with(b"/") || bytes.ends_with(b".") {
        return false;
    }
    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return false;
    }
    for &b in bytes {
        if b < 0x20 || b == 0x7f {
            return false;
        }
        if matches!(b, b' ' | b'~' | b'^' | b':' | b'?' | b'*' | b'[' | b'\\') {
            return false;
        }
    }
    for component in name.split('/') {
        if component.is_empty()
            || component.starts_with('.')
            || component.ends_with(".lock")
        {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_names() {
        for name in [
            "HEAD",
            "FETCH_HEAD",
            "refs/heads/main",
            "refs/heads/feature/x-1.2",
            "refs/tags/v1.0",
            "refs/remotes/origin/main",
        ] {
            assert!(is_valid(name), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in [
            "",
            "@",
            "refs/heads/",
            "refs//heads",
            "refs/heads/..x",
            "refs/heads/a..b",
            "refs/heads/x.lock",
            "refs/heads/.hidden",
            "refs/heads/sp ace",
            "refs/heads/col:on",
            "refs/heads/star*",
            "refs/heads/qu?est",
            "refs/heads/ca^ret",
            "refs/heads/br[acket",
            "refs/heads/back\\slash",
            "refs/heads/at@{sign",
            "refs/heads/end.",
            "lowercase-toplevel",
        ] {
            assert!(!is_valid(name), "{name} should be invalid");
        }
    }
}
