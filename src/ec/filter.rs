use std::fmt;

/// Which share paths a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `*`: every path.
    All,
    /// Dotted path prefixes.
    Prefixes(Vec<String>),
}

impl Filter {
    pub fn prefixes<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filter::Prefixes(prefixes.into_iter().map(Into::into).collect())
    }

    /// `f` matches `path` iff `path == f` or `path` starts with `f + "."`.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Filter::All => true,
            Filter::Prefixes(prefixes) => prefixes.iter().any(|prefix| {
                path == prefix
                    || (path.len() > prefix.len()
                        && path.starts_with(prefix.as_str())
                        && path.as_bytes()[prefix.len()] == b'.')
            }),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Filter::All
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::All => f.write_str("*"),
            Filter::Prefixes(prefixes) => write!(f, "({})", prefixes.join(" ")),
        }
    }
}
