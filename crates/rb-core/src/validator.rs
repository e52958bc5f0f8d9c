//! Pattern validation
//!
//! A pattern is checked against a general-purpose regex dialect (the one the
//! UI lets users type) and scanned for features the rule engine's restricted
//! RE2 dialect is known to reject. Those features only produce warnings: the
//! engine has the final word when the rule is installed.

use std::fmt::Write;

use regex_syntax::ast::parse::Parser;
use serde::{Deserialize, Serialize};

/// Longest pattern accepted, in UTF-16 code units.
pub const MAX_PATTERN_LENGTH: usize = 2000;

/// Feature markers the restricted dialect does not support.
const UNSUPPORTED_FEATURES: [(&str, &str); 5] = [
    ("\\b", "word boundaries (\\b)"),
    ("(?<=", "lookbehind assertions (?<=)"),
    ("(?<!", "negative lookbehind (?<!)"),
    ("(?=", "lookahead assertions (?=)"),
    ("(?!", "negative lookahead (?!)"),
];

const BACKREFERENCE_FEATURE: &str = "backreferences (\\1, \\2, etc.)";

/// Error type for rejected patterns.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Regex pattern cannot be empty")]
    Empty,
    #[error("Regex pattern is too long (max {max} characters)")]
    TooLong { len: usize, max: usize },
    #[error("{0}")]
    Syntax(String),
}

/// A pattern that passed validation, with any dialect warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    text: String,
    warnings: Vec<String>,
}

impl Pattern {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Outcome of [`validate`], shaped for the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "typescript", derive(ts_rs::TS), ts(export))]
pub struct ValidationResult {
    pub valid: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

/// Validate a candidate pattern.
pub fn validate(pattern: &str) -> ValidationResult {
    match check(pattern) {
        Ok(pattern) => ValidationResult {
            valid: true,
            error: None,
            warnings: pattern.warnings,
        },
        Err(e) => ValidationResult {
            valid: false,
            error: Some(e.to_string()),
            warnings: Vec::new(),
        },
    }
}

/// Validate a candidate pattern, returning it wrapped on success.
pub fn check(pattern: &str) -> Result<Pattern, ValidationError> {
    if pattern.trim().is_empty() {
        return Err(ValidationError::Empty);
    }

    // Measured in UTF-16 code units, as the UI's input field counts.
    let len = pattern.encode_utf16().count();
    if len > MAX_PATTERN_LENGTH {
        return Err(ValidationError::TooLong { len, max: MAX_PATTERN_LENGTH });
    }

    check_syntax(pattern)?;

    Ok(Pattern {
        text: pattern.to_string(),
        warnings: unsupported_features(pattern),
    })
}

/// Human-readable names of restricted-dialect features found in `pattern`.
pub fn unsupported_features(pattern: &str) -> Vec<String> {
    let mut warnings: Vec<String> = UNSUPPORTED_FEATURES
        .iter()
        .filter(|(marker, _)| pattern.contains(marker))
        .map(|(_, name)| feature_warning(name))
        .collect();

    let has_backreference = pattern
        .as_bytes()
        .windows(2)
        .any(|w| w[0] == b'\\' && w[1].is_ascii_digit());
    if has_backreference {
        warnings.push(feature_warning(BACKREFERENCE_FEATURE));
    }

    warnings
}

fn feature_warning(name: &str) -> String {
    format!("Regex contains {name} which may not work in the rule engine's RE2 dialect")
}

fn check_syntax(pattern: &str) -> Result<(), ValidationError> {
    let translated = translate(pattern)?;
    Parser::new()
        .parse(&translated)
        .map(|_| ())
        .map_err(|e| ValidationError::Syntax(e.kind().to_string()))
}

/// Rewrite a pattern in the general (JavaScript-style) dialect into the
/// `regex-syntax` form that parses the same way.
///
/// Lookaround openers become plain groups and backreferences become empty
/// groups. Escapes and braces that the general dialect reads literally are
/// emitted as literals, and character class quirks (`[]`, `[^]`, `[\b]`, a
/// literal `[`) are spelled out explicitly.
fn translate(pattern: &str) -> Result<String, ValidationError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len());
    let mut i = 0;

    while let Some(&c) = chars.get(i) {
        i = match c {
            '\\' => translate_escape(&chars, i + 1, &mut out, false),
            '[' => translate_class(&chars, i + 1, &mut out)?,
            '(' if chars.get(i + 1) == Some(&'?') => translate_group(&chars, i + 2, &mut out)?,
            '{' => match quantifier_len(&chars[i..]) {
                Some(len) => {
                    out.extend(&chars[i..i + len]);
                    i + len
                }
                None => {
                    out.push_str(r"\{");
                    i + 1
                }
            },
            '}' | ']' => {
                out.push('\\');
                out.push(c);
                i + 1
            }
            _ => {
                out.push(c);
                i + 1
            }
        };
    }

    Ok(out)
}

fn translate_group(chars: &[char], at: usize, out: &mut String) -> Result<usize, ValidationError> {
    for opener in [":", "=", "!", "<=", "<!"] {
        if starts_with(chars, at, opener) {
            out.push_str("(?:");
            return Ok(at + opener.len());
        }
    }

    if chars.get(at) != Some(&'<') {
        return Err(ValidationError::Syntax("invalid group".to_string()));
    }
    let name = &chars[at + 1..];
    let name_len = name
        .iter()
        .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
        .count();
    if name_len == 0 || name.get(name_len) != Some(&'>') {
        return Err(ValidationError::Syntax("invalid capture group name".to_string()));
    }
    out.push_str("(?<");
    out.extend(&name[..name_len]);
    out.push('>');
    Ok(at + name_len + 2)
}

fn translate_class(chars: &[char], at: usize, out: &mut String) -> Result<usize, ValidationError> {
    let mut i = at;
    let negated = chars.get(i) == Some(&'^');
    if negated {
        i += 1;
    }

    // `[]` never matches, `[^]` matches any character.
    if chars.get(i) == Some(&']') {
        out.push_str(if negated { r"[\x00-\x{10FFFF}]" } else { r"[^\x00-\x{10FFFF}]" });
        return Ok(i + 1);
    }

    out.push('[');
    if negated {
        out.push('^');
    }

    let mut after_set = false;
    while let Some(&c) = chars.get(i) {
        match c {
            ']' => {
                out.push(']');
                return Ok(i + 1);
            }
            '\\' => {
                after_set = chars.get(i + 1).is_some_and(|e| is_class_escape(*e));
                i = translate_escape(chars, i + 1, out, true);
                continue;
            }
            // A dash next to a class escape is literal, not a range.
            '-' if after_set || (chars.get(i + 1) == Some(&'\\')
                && chars.get(i + 2).is_some_and(|e| is_class_escape(*e))) =>
            {
                out.push_str(r"\-");
            }
            '[' | '&' | '~' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
        after_set = false;
        i += 1;
    }

    Err(ValidationError::Syntax("unclosed character class".to_string()))
}

/// Translate the escape whose body starts at `at` (an octal escape is
/// always led by a digit `0`-`7`), returning the index after it.
fn translate_escape(chars: &[char], at: usize, out: &mut String, in_class: bool) -> usize {
    let Some(&c) = chars.get(at) else {
        // Trailing backslash; left for the parser to reject.
        out.push('\\');
        return at;
    };

    match c {
        'd' | 'D' | 'w' | 'W' | 's' | 'S' | 't' | 'n' | 'r' | 'v' | 'f' => {
            out.push('\\');
            out.push(c);
            at + 1
        }
        'b' if in_class => {
            push_code_point(out, 0x08);
            at + 1
        }
        'b' | 'B' if !in_class => {
            out.push('\\');
            out.push(c);
            at + 1
        }
        'c' => match chars.get(at + 1) {
            Some(letter) if letter.is_ascii_alphabetic() => {
                push_code_point(out, *letter as u32 % 32);
                at + 2
            }
            _ => {
                out.push_str(r"\\c");
                at + 1
            }
        },
        'x' => hex_escape(chars, at + 1, 2, out).unwrap_or_else(|| {
            out.push('x');
            at + 1
        }),
        'u' => hex_escape(chars, at + 1, 4, out).unwrap_or_else(|| {
            out.push('u');
            at + 1
        }),
        'k' if !in_class && chars.get(at + 1) == Some(&'<') => {
            match chars[at + 2..].iter().position(|c| *c == '>') {
                Some(len) => {
                    out.push_str("(?:)");
                    at + len + 3
                }
                None => {
                    out.push('k');
                    at + 1
                }
            }
        }
        '0'..='7' if in_class || (c == '0' && !chars.get(at + 1).is_some_and(char::is_ascii_digit)) => {
            octal_escape(chars, at, out)
        }
        '1'..='9' if !in_class => {
            // Backreference; the restricted dialect has none to check.
            let digits = chars[at..].iter().take_while(|c| c.is_ascii_digit()).count();
            out.push_str("(?:)");
            at + digits
        }
        '0' => octal_escape(chars, at, out),
        // `\<` and `\>` are word assertions to the parser but literals here.
        c if c.is_ascii_punctuation() && c != '<' && c != '>' => {
            out.push('\\');
            out.push(c);
            at + 1
        }
        // Any other escaped character stands for itself.
        c => {
            out.push_str(&regex_syntax::escape(c.encode_utf8(&mut [0; 4])));
            at + 1
        }
    }
}

fn hex_escape(chars: &[char], at: usize, len: usize, out: &mut String) -> Option<usize> {
    let digits = chars.get(at..at + len)?;
    let mut value = 0;
    for digit in digits {
        value = value * 16 + digit.to_digit(16)?;
    }
    push_code_point(out, value);
    Some(at + len)
}

fn octal_escape(chars: &[char], at: usize, out: &mut String) -> usize {
    let mut value = 0;
    let mut len = 0;
    while len < 3 {
        match chars.get(at + len).and_then(|c| c.to_digit(8)) {
            Some(digit) if value * 8 + digit <= 0o377 => {
                value = value * 8 + digit;
                len += 1;
            }
            _ => break,
        }
    }
    push_code_point(out, value);
    at + len
}

fn push_code_point(out: &mut String, value: u32) {
    // Lone surrogates have no scalar value; any placeholder parses the same.
    let value = if (0xD800..=0xDFFF).contains(&value) { 0xFFFD } else { value };
    let _ = write!(out, r"\x{{{value:X}}}");
}

/// Length of the counted repetition `{n}`, `{n,}` or `{n,m}` at the start of
/// `chars`, if there is one.
fn quantifier_len(chars: &[char]) -> Option<usize> {
    let digits = |from: usize| chars[from..].iter().take_while(|c| c.is_ascii_digit()).count();

    let lower = digits(1);
    if lower == 0 {
        return None;
    }
    let mut end = 1 + lower;
    if chars.get(end) == Some(&',') {
        end += 1 + digits(end + 1);
    }
    (chars.get(end) == Some(&'}')).then_some(end + 1)
}

fn is_class_escape(c: char) -> bool {
    matches!(c, 'd' | 'D' | 'w' | 'W' | 's' | 'S')
}

fn starts_with(chars: &[char], at: usize, prefix: &str) -> bool {
    prefix
        .chars()
        .enumerate()
        .all(|(offset, c)| chars.get(at + offset) == Some(&c))
}
