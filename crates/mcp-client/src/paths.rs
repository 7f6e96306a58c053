//! Path and environment-variable expansion for configuration values.

use std::path::{Component, Path, PathBuf};

/// Replace `%VAR%`, `${VAR}`, `${VAR:-default}` and `$VAR` with values from
/// the process environment. Unknown variables are left as written.
pub fn expand_env_vars(input: &str) -> String {
    expand_with(input, |name| std::env::var(name).ok())
}

fn expand_with<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '%' => {
                let rest: String = chars.clone().collect();
                match rest.find('%') {
                    Some(end) if end > 0 && is_var_name(&rest[..end]) => {
                        let name = &rest[..end];
                        match lookup(name) {
                            Some(value) => result.push_str(&value),
                            None => {
                                result.push('%');
                                result.push_str(name);
                                result.push('%');
                            }
                        }
                        for _ in 0..=name.chars().count() {
                            chars.next();
                        }
                    }
                    _ => result.push('%'),
                }
            }
            '$' if chars.peek() == Some(&'{') => {
                chars.next(); // consume '{'
                let mut expr = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    expr.push(c);
                }
                if !closed {
                    result.push_str("${");
                    result.push_str(&expr);
                    continue;
                }
                let (name, default) = match expr.find(":-") {
                    Some(idx) => (&expr[..idx], Some(&expr[idx + 2..])),
                    None => (expr.as_str(), None),
                };
                match (lookup(name), default) {
                    (Some(value), _) => result.push_str(&value),
                    (None, Some(default)) => result.push_str(default),
                    (None, None) => {
                        result.push_str("${");
                        result.push_str(&expr);
                        result.push('}');
                    }
                }
            }
            '$' if chars.peek().is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match lookup(&name) {
                    Some(value) => result.push_str(&value),
                    None => {
                        result.push('$');
                        result.push_str(&name);
                    }
                }
            }
            _ => result.push(ch),
        }
    }

    result
}

fn is_var_name(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '(' || c == ')')
}

/// Expand a leading `~` (alone, or followed by a separator) to the user's
/// home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand environment variables and `~`, then make the path absolute
/// against `base` and drop `.`/`..` components lexically.
pub fn resolve_path(input: &str, base: &Path) -> PathBuf {
    let expanded = expand_home(&expand_env_vars(input.trim()));
    let joined = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };
    normalize(&joined)
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
