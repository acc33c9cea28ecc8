use std::fmt;

use regex::Regex;

/// A name predicate: exact text, a `*`/`?` wildcard pattern or a regex.
#[derive(Clone)]
pub enum NamePattern {
    Exact(String),
    Wildcard { source: String, compiled: Regex },
    Regex(Regex),
}

impl NamePattern {
    pub fn exact(name: impl Into<String>) -> Self {
        NamePattern::Exact(name.into())
    }

    /// `*` matches any run of characters (dots included), `?` exactly one.
    /// A pattern without either is an exact match.
    pub fn wildcard(pattern: &str) -> Self {
        if !pattern.contains(['*', '?']) {
            return NamePattern::Exact(pattern.to_string());
        }
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for c in pattern.chars() {
            if c == '*' || c == '?' {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if c == '*' { ".*" } else { "." });
            } else {
                literal.push(c);
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');
        match Regex::new(&expr) {
            Ok(compiled) => NamePattern::Wildcard { source: pattern.to_string(), compiled },
            // escaped input always compiles; keep the literal meaning otherwise
            Err(_) => NamePattern::Exact(pattern.to_string()),
        }
    }

    /// A full-match regular expression.
    pub fn regex(expr: &str) -> Result<Self, regex::Error> {
        Ok(NamePattern::Regex(Regex::new(&format!("^(?:{expr})$"))?))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            NamePattern::Exact(s) => s == name,
            NamePattern::Wildcard { compiled, .. } | NamePattern::Regex(compiled) => compiled.is_match(name),
        }
    }
}

impl fmt::Debug for NamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamePattern::Exact(s) => write!(f, "Exact({s:?})"),
            NamePattern::Wildcard { source, .. } => write!(f, "Wildcard({source:?})"),
            NamePattern::Regex(r) => write!(f, "Regex({:?})", r.as_str()),
        }
    }
}

impl From<&str> for NamePattern {
    fn from(pattern: &str) -> Self {
        NamePattern::wildcard(pattern)
    }
}
