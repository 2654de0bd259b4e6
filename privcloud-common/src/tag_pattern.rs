/// Tag-value pattern helpers shared by the orchestrator and the providers.
///
/// Cloud tag filters accept `*` as a wildcard; the in-memory provider and the
/// fleet guard need the same semantics locally.

/// Pattern selecting every machine of a management group (`<group>*`).
pub fn group_pattern(group: &str) -> String {
    format!("{}*", group.trim())
}

/// Return true if `value` matches `pattern`.
///
/// Pattern rules:
/// - Case-sensitive (tag values are)
/// - `*` matches any substring (including empty)
/// - No other glob features are supported
pub fn value_matches(value: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return value == pattern;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts.first().copied().unwrap_or("");
    let last = parts.last().copied().unwrap_or("");

    // Prefix and suffix must not overlap, e.g. "ab*ba" does not match "aba".
    if value.len() < first.len() + last.len() {
        return false;
    }
    if !value.starts_with(first) || !value.ends_with(last) {
        return false;
    }

    // Middle parts must appear in order between the prefix and the suffix.
    let mut idx = first.len();
    let end = value.len() - last.len();
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match value[idx..end].find(part) {
            Some(pos) => idx += pos + part.len(),
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_and_star() {
        assert!(value_matches("mgmt1", "mgmt1"));
        assert!(!value_matches("mgmt1", "mgmt2"));
        assert!(value_matches("anything", "*"));
    }

    #[test]
    fn group_prefix() {
        let p = group_pattern(" privcloud-mgmt ");
        assert_eq!(p, "privcloud-mgmt*");
        assert!(value_matches("privcloud-mgmt1", &p));
        assert!(value_matches("privcloud-mgmt", &p));
        assert!(!value_matches("privcloud-agent-1", &p));
        assert!(!value_matches("PRIVCLOUD-MGMT1", &p));
    }

    #[test]
    fn middle_and_suffix() {
        assert!(value_matches("web-eu-01", "web*01"));
        assert!(value_matches("web-eu-01", "*eu*"));
        assert!(!value_matches("web-eu-02", "web*01"));
        assert!(!value_matches("aba", "ab*ba"));
        assert!(value_matches("abba", "ab*ba"));
    }
}
