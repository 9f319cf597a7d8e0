//! A YAML writer reproducing, byte for byte, the output of the encoder the image factory hashes
//! schematics with (`gopkg.in/yaml.v3` with its default settings).
//!
//! Layout rules:
//! - nested blocks are aligned to multiples of four columns;
//! - sequence items are indented below their key, a mapping inside an item starts right after
//!   the `- ` indicator;
//! - multi-line strings become literal block scalars;
//! - strings that would read back as something else (`"1"`, `"true"`, `""`) are double quoted,
//!   strings a plain scalar cannot express are single quoted;
//! - lines are never wrapped.

use std::{cmp::Ordering, fmt::Write as _, sync::LazyLock};

use regex::Regex;
use serde_yaml::{Mapping, Value};

const BEST_INDENT: usize = 4;

// Resolution of plain scalars, mirroring the encoder's implicit typing.
static INT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(0[xX][0-9a-fA-F]+|0[oO][0-7]+|0[bB][01]+|0[0-7]*|[1-9][0-9]*)$")
        .expect("failed to compile integer regex")
});
static FLOAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?(\.[0-9]+|[0-9]+(\.[0-9]*)?)([eE][-+]?[0-9]+)?$")
        .expect("failed to compile float regex")
});
static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[0-9]{4}-[0-9]{1,2}-[0-9]{1,2}([Tt ][0-9]{1,2}:[0-9]{1,2}:[0-9]{1,2}(\.[0-9]+)?(Z|[-+][0-9]{1,2}:[0-9]{2})?)?$",
    )
    .expect("failed to compile timestamp regex")
});
static BASE_60_FLOAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-+]?[0-9][0-9_]*(?::[0-5]?[0-9])+(?:\.[0-9_]*)?$")
        .expect("failed to compile base 60 float regex")
});

/// Plain scalars with a fixed non-string meaning.
const RESERVED: &[&str] = &[
    "", "~", "null", "Null", "NULL", "true", "True", "TRUE", "false", "False", "FALSE", ".nan",
    ".NaN", ".NAN", ".inf", ".Inf", ".INF", "+.inf", "+.Inf", "+.INF", "-.inf", "-.Inf", "-.INF",
    "<<",
];

/// YAML 1.1 booleans, quoted so older parsers read them back as strings.
const OLD_BOOLEANS: &[&str] = &[
    "y", "Y", "yes", "Yes", "YES", "on", "On", "ON", "n", "N", "no", "No", "NO", "off", "Off",
    "OFF",
];

/// Encodes `value` as a single YAML document without a leading `---`.
pub fn to_string(value: &Value) -> String {
    let mut out = String::new();
    match value {
        Value::Mapping(mapping) if !mapping.is_empty() => {
            write_mapping(&mut out, mapping, 0, false);
        }
        Value::Sequence(items) if !items.is_empty() => {
            write_sequence(&mut out, items, 0, false);
        }
        Value::Tagged(tagged) => return to_string(&tagged.value),
        other => write_value(&mut out, other, 0, false),
    }
    out
}

/// Orders mapping keys the way the encoder orders the keys of a map: numbers embedded in keys
/// compare by value, and a letter sorts after any other character unless it follows a digit.
pub fn compare_keys(left: &str, right: &str) -> Ordering {
    let left: Vec<char> = left.chars().collect();
    let right: Vec<char> = right.chars().collect();
    let mut digits = false;

    for i in 0..left.len().min(right.len()) {
        let (l, r) = (left[i], right[i]);
        if l == r {
            digits = l.is_ascii_digit();
            continue;
        }
        let (l_letter, r_letter) = (l.is_alphabetic(), r.is_alphabetic());
        if l_letter && r_letter {
            return l.cmp(&r);
        }
        if l_letter || r_letter {
            let left_first = if digits { l_letter } else { r_letter };
            return if left_first {
                Ordering::Less
            } else {
                Ordering::Greater
            };
        }

        // A run of digits compares by value, unless it continues a number with leading zeros.
        let mut l_number: u64 = 0;
        let mut r_number: u64 = 0;
        if l == '0' || r == '0' {
            let continues_number = left[..i]
                .iter()
                .rev()
                .take_while(|c| c.is_ascii_digit())
                .any(|c| *c != '0');
            if continues_number {
                l_number = 1;
                r_number = 1;
            }
        }
        let l_end = number_end(&left, i, &mut l_number);
        let r_end = number_end(&right, i, &mut r_number);
        if l_number != r_number {
            return l_number.cmp(&r_number);
        }
        if l_end != r_end {
            return l_end.cmp(&r_end);
        }
        return l.cmp(&r);
    }
    left.len().cmp(&right.len())
}

fn number_end(chars: &[char], start: usize, number: &mut u64) -> usize {
    let mut end = start;
    while let Some(digit) = chars.get(end).and_then(|c| c.to_digit(10)) {
        *number = number.wrapping_mul(10).wrapping_add(u64::from(digit));
        end += 1;
    }
    end
}

/// Indentation of the block nested below a node at `indent`.
fn nested_indent(indent: usize) -> usize {
    (indent / BEST_INDENT + 1) * BEST_INDENT
}

fn push_indent(out: &mut String, indent: usize) {
    out.extend(std::iter::repeat_n(' ', indent));
}

/// Writes the entries of `mapping`, keys at column `indent`. With `inline_first`, the first key
/// continues the current line.
fn write_mapping(out: &mut String, mapping: &Mapping, indent: usize, inline_first: bool) {
    for (position, (key, value)) in mapping.iter().enumerate() {
        if position > 0 || !inline_first {
            push_indent(out, indent);
        }
        out.push_str(&inline(key));
        out.push(':');
        write_nested(out, value, nested_indent(indent), false);
    }
}

fn write_sequence(out: &mut String, items: &[Value], indent: usize, inline_first: bool) {
    for (position, item) in items.iter().enumerate() {
        if position > 0 || !inline_first {
            push_indent(out, indent);
        }
        out.push('-');
        write_nested(out, item, indent + 2, true);
    }
}

/// Writes `value` after a `key:` or `-` indicator, with its block content at `indent`. Inside a
/// sequence item, a collection starts on the indicator's line.
fn write_nested(out: &mut String, value: &Value, indent: usize, in_item: bool) {
    let separator = if in_item { ' ' } else { '\n' };
    match value {
        Value::Mapping(mapping) if !mapping.is_empty() => {
            out.push(separator);
            write_mapping(out, mapping, indent, in_item);
        }
        Value::Sequence(items) if !items.is_empty() => {
            out.push(separator);
            write_sequence(out, items, indent, in_item);
        }
        Value::Tagged(tagged) => write_nested(out, &tagged.value, indent, in_item),
        other => {
            out.push(' ');
            write_value(out, other, indent, true);
        }
    }
}

/// Writes a scalar or an empty collection, followed by a line break.
fn write_value(out: &mut String, value: &Value, block_indent: usize, block_allowed: bool) {
    match value {
        Value::String(string) => write_string(out, string, block_indent, block_allowed),
        other => {
            out.push_str(&inline(other));
            out.push('\n');
        }
    }
}

fn inline(value: &Value) -> String {
    match value {
        Value::Null => "null".to_owned(),
        Value::Bool(boolean) => boolean.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(string) => match Style::of(string) {
            Style::Literal | Style::DoubleQuoted => double_quoted(string),
            Style::Plain => string.clone(),
            Style::SingleQuoted => single_quoted(string),
        },
        Value::Sequence(_) => "[]".to_owned(),
        Value::Mapping(_) => "{}".to_owned(),
        Value::Tagged(tagged) => inline(&tagged.value),
    }
}

fn write_string(out: &mut String, string: &str, block_indent: usize, block_allowed: bool) {
    match Style::of(string) {
        Style::Literal if block_allowed => write_literal(out, string, block_indent),
        Style::Literal | Style::DoubleQuoted => {
            out.push_str(&double_quoted(string));
            out.push('\n');
        }
        Style::Plain => {
            out.push_str(string);
            out.push('\n');
        }
        Style::SingleQuoted => {
            out.push_str(&single_quoted(string));
            out.push('\n');
        }
    }
}

fn write_literal(out: &mut String, string: &str, indent: usize) {
    out.push('|');
    if string.starts_with([' ', '\n']) {
        // The hint is always the configured indentation, wherever the content ends up.
        let _ = write!(out, "{BEST_INDENT}");
    }
    if !string.ends_with('\n') {
        out.push('-');
    } else if string == "\n" || string.ends_with("\n\n") {
        out.push('+');
    }
    out.push('\n');

    let mut line_start = true;
    for c in string.chars() {
        if c == '\n' {
            out.push('\n');
            line_start = true;
        } else {
            if line_start {
                push_indent(out, indent);
                line_start = false;
            }
            out.push(c);
        }
    }
    if !string.ends_with('\n') {
        out.push('\n');
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Style {
    Plain,
    SingleQuoted,
    DoubleQuoted,
    Literal,
}

impl Style {
    fn of(string: &str) -> Self {
        let analysis = Analysis::of(string);
        if string.contains('\n') {
            return if analysis.block_allowed {
                Self::Literal
            } else {
                Self::DoubleQuoted
            };
        }
        if !reads_back_as_string(string) {
            return Self::DoubleQuoted;
        }
        if analysis.plain_allowed {
            Self::Plain
        } else if analysis.single_quoted_allowed {
            Self::SingleQuoted
        } else {
            Self::DoubleQuoted
        }
    }
}

/// Whether `string` written as a plain scalar would be read back as the same string.
fn reads_back_as_string(string: &str) -> bool {
    if RESERVED.contains(&string) || OLD_BOOLEANS.contains(&string) {
        return false;
    }
    let Some(first) = string.chars().next() else {
        return false;
    };
    if first.is_ascii_digit() && TIMESTAMP.is_match(string) {
        return false;
    }
    if matches!(first, '0'..='9' | '+' | '-' | '.') {
        let number = string.replace('_', "");
        if INT.is_match(&number) || FLOAT.is_match(&number) {
            return false;
        }
    }
    let base_60 = matches!(first, '0'..='9' | '+' | '-') && string.contains(':');
    !(base_60 && BASE_60_FLOAT.is_match(string))
}

/// Which scalar styles can represent a string unchanged.
struct Analysis {
    plain_allowed: bool,
    single_quoted_allowed: bool,
    block_allowed: bool,
}

impl Analysis {
    fn of(string: &str) -> Self {
        let chars: Vec<char> = string.chars().collect();
        let is_blank = |index: usize| {
            chars
                .get(index)
                .is_none_or(|c| matches!(*c, ' ' | '\t' | '\n'))
        };

        let mut indicators = string.starts_with("---") || string.starts_with("...");
        let (mut leading_space, mut leading_break) = (false, false);
        let (mut trailing_space, mut trailing_break) = (false, false);
        let (mut break_space, mut space_break) = (false, false);
        let (mut line_breaks, mut tabs, mut special) = (false, false, false);
        let (mut previous_space, mut previous_break) = (false, false);

        for (index, &c) in chars.iter().enumerate() {
            let followed_by_blank = is_blank(index + 1);
            if index == 0 {
                indicators |= matches!(
                    c,
                    '#' | ',' | '[' | ']' | '{' | '}' | '&' | '*' | '!' | '|' | '>' | '\''
                        | '"' | '%' | '@' | '`'
                ) || (matches!(c, '?' | ':' | '-') && followed_by_blank);
            } else {
                indicators |= (c == ':' && followed_by_blank)
                    || (c == '#' && matches!(chars[index - 1], ' ' | '\t' | '\n'));
            }

            if c == '\t' {
                tabs = true;
            } else if !is_printable(c) || c == '\u{FEFF}' {
                special = true;
            }

            let last = index + 1 == chars.len();
            if c == ' ' {
                leading_space |= index == 0;
                trailing_space |= last;
                break_space |= previous_break;
                previous_space = true;
                previous_break = false;
            } else if c == '\n' {
                line_breaks = true;
                leading_break |= index == 0;
                trailing_break |= last;
                space_break |= previous_space;
                previous_space = false;
                previous_break = true;
            } else {
                previous_space = false;
                previous_break = false;
            }
        }

        let edge_whitespace = leading_space || leading_break || trailing_space || trailing_break;
        Self {
            plain_allowed: !string.is_empty()
                && !indicators
                && !edge_whitespace
                && !break_space
                && !space_break
                && !tabs
                && !special
                && !line_breaks,
            single_quoted_allowed: !break_space && !space_break && !tabs && !special,
            block_allowed: !trailing_space && !space_break && !special,
        }
    }
}

fn is_printable(c: char) -> bool {
    matches!(c,
        '\n' | '\u{20}'..='\u{7E}' | '\u{85}' | '\u{A0}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}'
            | '\u{10000}'..='\u{10FFFF}')
}

fn single_quoted(string: &str) -> String {
    format!("'{}'", string.replace('\'', "''"))
}

fn double_quoted(string: &str) -> String {
    let mut out = String::with_capacity(string.len() + 2);
    out.push('"');
    for c in string.chars() {
        let escaped = match c {
            '\0' => "\\0",
            '\u{7}' => "\\a",
            '\u{8}' => "\\b",
            '\t' => "\\t",
            '\n' => "\\n",
            '\u{B}' => "\\v",
            '\u{C}' => "\\f",
            '\r' => "\\r",
            '\u{1B}' => "\\e",
            '"' => "\\\"",
            '\\' => "\\\\",
            '\u{85}' => "\\N",
            '\u{2028}' => "\\L",
            '\u{2029}' => "\\P",
            c if !is_printable(c) || c == '\u{FEFF}' => {
                let code = u32::from(c);
                let _ = match code {
                    0..=0xFF => write!(out, "\\x{code:02X}"),
                    0x100..=0xFFFF => write!(out, "\\u{code:04X}"),
                    _ => write!(out, "\\U{code:08X}"),
                };
                continue;
            }
            c => {
                out.push(c);
                continue;
            }
        };
        out.push_str(escaped);
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("net.ifnames=0", "net.ifnames=0")]
    #[case("siderolabs/intel-ucode", "siderolabs/intel-ucode")]
    #[case("1", r#""1""#)]
    #[case("0x1F", r#""0x1F""#)]
    #[case("1.5", r#""1.5""#)]
    #[case("1e3", r#""1e3""#)]
    #[case("true", r#""true""#)]
    #[case("yes", r#""yes""#)]
    #[case("null", r#""null""#)]
    #[case("", r#""""#)]
    #[case("2024-01-02", r#""2024-01-02""#)]
    #[case("1:30", r#""1:30""#)]
    #[case("{x}", "'{x}'")]
    #[case("- item", "'- item'")]
    #[case("key: value", "'key: value'")]
    #[case("a #comment", "'a #comment'")]
    #[case(" padded", "' padded'")]
    #[case("it's", "it's")]
    #[case("a\tb", r#""a\tb""#)]
    #[case("console=ttyS0,115200", "console=ttyS0,115200")]
    fn scalar_styles(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(inline(&Value::from(input)), expected);
    }

    #[test]
    fn sequences_and_nested_mappings_follow_block_alignment() {
        let value: Value = serde_yaml::from_str(indoc! {"
            a:
              b:
                - x
                - key: 1
                  value: y
              c: []
              d: {}
        "})
        .unwrap();

        assert_eq!(to_string(&value), indoc! {"
            a:
                b:
                    - x
                    - key: 1
                      value: y
                c: []
                d: {}
        "});
    }

    #[test]
    fn multi_line_strings_become_literal_blocks_below_their_key() {
        let value: Value = serde_yaml::from_str(indoc! {r#"
            items:
              - key: 10
                value: "addresses:\n  - 10.0.0.2/24\n"
              - key: 11
                value: "no trailing\nbreak"
              - key: 12
                value: "kept\n\n"
        "#})
        .unwrap();

        let encoded = to_string(&value);

        assert_eq!(encoded, indoc! {"
            items:
                - key: 10
                  value: |
                    addresses:
                      - 10.0.0.2/24
                - key: 11
                  value: |-
                    no trailing
                    break
                - key: 12
                  value: |+
                    kept

        "});
        let reparsed: Value = serde_yaml::from_str(&encoded).unwrap();
        assert_eq!(reparsed, value);
    }

    #[test]
    fn line_with_trailing_space_forces_double_quotes() {
        assert_eq!(
            to_string(&Value::from("trailing \nspace")),
            "\"trailing \\nspace\"\n"
        );
    }

    #[rstest]
    #[case(&["b", "a", "c"], &["a", "b", "c"])]
    #[case(&["item10", "item2", "item1"], &["item1", "item2", "item10"])]
    #[case(&["aa", "a1", "a_"], &["a_", "a1", "aa"])]
    #[case(&["1a", "11"], &["1a", "11"])]
    fn map_keys_sort_naturally(#[case] keys: &[&str], #[case] expected: &[&str]) {
        let mut keys = keys.to_vec();
        keys.sort_by(|l, r| compare_keys(l, r));
        assert_eq!(keys, expected);
    }
}
