use regex::Regex;

/// Shell-style name patterns (`*`, `?`, `[...]`, `[!...]`) compiled to
/// anchored regexes.
#[derive(Debug, Clone)]
pub struct GlobSet {
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl GlobSet {
    /// An empty pattern list means "everything".
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut raw: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        if raw.is_empty() {
            raw.push("*".to_string());
        }
        let compiled = raw.iter().filter_map(|p| compile(p)).collect();
        Self {
            patterns: raw,
            compiled,
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_match(&self, name: &str) -> bool {
        self.compiled.iter().any(|re| re.is_match(name))
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    translate(pattern)
        .and_then(|re| Regex::new(&re).ok())
        // Unbalanced or empty classes match literally.
        .or_else(|| Regex::new(&format!("^{}$", regex::escape(pattern))).ok())
}

fn translate(pattern: &str) -> Option<String> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(inner, '\\' | '[' | '^' | '&' | '~') {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if !closed {
                    return None;
                }
                out.push('[');
                out.push_str(&class);
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question() {
        let set = GlobSet::new(&["code_*", "wai?"]);
        assert!(set.is_match("code_file_read"));
        assert!(set.is_match("wait"));
        assert!(!set.is_match("reply"));
        assert!(!set.is_match("xcode_file"));
    }

    #[test]
    fn test_empty_means_everything() {
        let set = GlobSet::new::<&str>(&[]);
        assert_eq!(set.patterns(), &["*".to_string()]);
        assert!(set.is_match("anything"));
    }

    #[test]
    fn test_character_classes() {
        let set = GlobSet::new(&["dev_[a-m]*"]);
        assert!(set.is_match("dev_diff"));
        assert!(!set.is_match("dev_show"));

        let negated = GlobSet::new(&["[!d]*"]);
        assert!(negated.is_match("reply"));
        assert!(!negated.is_match("dev_diff"));
    }

    #[test]
    fn test_dots_are_literal() {
        let set = GlobSet::new(&["a.b"]);
        assert!(set.is_match("a.b"));
        assert!(!set.is_match("axb"));
    }

    #[test]
    fn test_unclosed_class_is_literal() {
        let set = GlobSet::new(&["ab[c"]);
        assert!(set.is_match("ab[c"));
    }
}
