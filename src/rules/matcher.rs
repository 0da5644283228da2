use regex::Regex;

/// A compiled rule pattern, tested against `host + path-with-query`.
///
/// Patterns written as `(…)` are regexes taken verbatim. Anything else is a
/// literal with `*` wildcards: a leading `http://` or `https://` is
/// stripped, literal segments are escaped, and each `*` becomes a lazy
/// `.*?`. Matching is unanchored; authors anchor explicitly with `^`/`$`.
#[derive(Debug, Clone)]
pub struct Matcher {
    pattern: Regex,
}

impl Matcher {
    pub fn compile(pattern: &str) -> anyhow::Result<Self> {
        let pattern = if pattern.starts_with('(') && pattern.ends_with(')') {
            Regex::new(pattern)?
        } else {
            let stripped = pattern
                .strip_prefix("http://")
                .or_else(|| pattern.strip_prefix("https://"))
                .unwrap_or(pattern);
            let escaped = stripped
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*?");
            Regex::new(&escaped)?
        };
        Ok(Self { pattern })
    }

    pub fn matches(&self, target: &str) -> bool {
        self.pattern.is_match(target)
    }
}
