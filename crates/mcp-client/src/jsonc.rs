//! Lenient JSON: `//` and `/* */` comments plus trailing commas.
//!
//! Both passes track string literals so that `"http://x"` or `"a,]"` inside
//! a value survive untouched.

/// Strip comments and trailing commas so the text parses as strict JSON.
pub fn to_strict_json(text: &str) -> String {
    remove_trailing_commas(&remove_comments(text))
}

/// Remove `//` line comments and `/* */` block comments outside strings.
fn remove_comments(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut in_string = false;
    let mut escape_next = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            result.push(c);
            if escape_next {
                escape_next = false;
            } else if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match (c, chars.get(i + 1)) {
            ('"', _) => {
                in_string = true;
                result.push(c);
                i += 1;
            }
            ('/', Some('/')) => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ('/', Some('*')) => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    // Keep line structure so parse errors report real lines.
                    if chars[i] == '\n' {
                        result.push('\n');
                    }
                    i += 1;
                }
                i += 2;
            }
            _ => {
                result.push(c);
                i += 1;
            }
        }
    }

    result
}

/// Remove commas directly followed (ignoring whitespace) by `}` or `]`.
fn remove_trailing_commas(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escape_next {
                escape_next = false;
            } else if c == '\\' {
                escape_next = true;
            } else if c == '"' {
                in_string = false;
            }
            result.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
            result.push(c);
            continue;
        }
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        result.push(c);
    }

    result
}
