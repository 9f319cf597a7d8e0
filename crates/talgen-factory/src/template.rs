//! Minimal `{{.Field}}` placeholder templates for image references.
//!
//! Only field substitution is supported. Everything outside a placeholder is copied verbatim.

use std::sync::LazyLock;

use regex::Regex;
use snafu::{OptionExt, Snafu, ensure};

type Result<T, E = Error> = std::result::Result<T, E>;

static PLACEHOLDER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.([A-Za-z][A-Za-z0-9_]*)\s*\}\}")
        .expect("failed to compile placeholder regex")
});

#[derive(Debug, Eq, PartialEq, Snafu)]
pub enum Error {
    #[snafu(display("template {name:?}: unterminated or malformed action at byte {offset}"))]
    MalformedAction { name: String, offset: usize },

    #[snafu(display("template {name:?}: no field {field:?} available for rendering"))]
    UnknownField { name: String, field: String },
}

#[derive(Debug, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Field(&'a str),
}

/// A parsed template, borrowing from its source text.
#[derive(Debug)]
pub struct Template<'a> {
    name: &'a str,
    segments: Vec<Segment<'a>>,
}

impl<'a> Template<'a> {
    /// Splits `source` into literal text and `{{.Field}}` placeholders.
    ///
    /// Any `{{` or `}}` that is not part of a well-formed placeholder is rejected.
    pub fn parse(name: &'a str, source: &'a str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut position = 0;

        for captures in PLACEHOLDER_REGEX.captures_iter(source) {
            let (Some(whole), Some(field)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            push_literal(&mut segments, name, source, position, whole.start())?;
            segments.push(Segment::Field(field.as_str()));
            position = whole.end();
        }
        push_literal(&mut segments, name, source, position, source.len())?;

        Ok(Self { name, segments })
    }

    /// Substitutes every placeholder with the value of the field of the same name.
    pub fn render(&self, fields: &[(&str, &str)]) -> Result<String> {
        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Field(field) => {
                    let value = fields
                        .iter()
                        .find_map(|(key, value)| (key == field).then_some(*value))
                        .with_context(|| UnknownFieldSnafu {
                            name: self.name,
                            field: *field,
                        })?;
                    rendered.push_str(value);
                }
            }
        }
        Ok(rendered)
    }
}

fn push_literal<'a>(
    segments: &mut Vec<Segment<'a>>,
    name: &str,
    source: &'a str,
    start: usize,
    end: usize,
) -> Result<()> {
    let literal = &source[start..end];
    let stray = literal.find("{{").or_else(|| literal.find("}}"));
    ensure!(stray.is_none(), MalformedActionSnafu {
        name,
        offset: start + stray.unwrap_or_default(),
    });
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(())
}

/// Parses and renders `source` in one go.
pub fn render(name: &str, source: &str, fields: &[(&str, &str)]) -> Result<String> {
    Template::parse(name, source)?.render(fields)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn renders_installer_template() {
        let rendered = render(
            "installer",
            "{{.RegistryURL}}/installer/{{.ID}}:{{.Version}}",
            &[
                ("RegistryURL", "factory.talos.dev"),
                ("ID", "abc"),
                ("Version", "v1.7.0"),
            ],
        )
        .expect("template renders");

        assert_eq!(rendered, "factory.talos.dev/installer/abc:v1.7.0");
    }

    #[test]
    fn tolerates_whitespace_inside_actions() {
        let rendered = render("spaced", "{{ .ID }}-{{.ID}}", &[("ID", "x")]).unwrap();
        assert_eq!(rendered, "x-x");
    }

    #[rstest]
    #[case("{{.ID}", 0)]
    #[case("prefix/{{ID}}", 7)]
    #[case("{{.ID}}/}}", 8)]
    fn rejects_malformed_actions(#[case] source: &str, #[case] offset: usize) {
        let err = Template::parse("broken", source).expect_err("template must not parse");
        assert_eq!(err, Error::MalformedAction {
            name: "broken".to_owned(),
            offset,
        });
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = render("iso", "{{.Arch}}", &[("ID", "x")]).expect_err("field is missing");
        assert_eq!(err, Error::UnknownField {
            name: "iso".to_owned(),
            field: "Arch".to_owned(),
        });
    }
}
