//! Query expression templates.
//!
//! Query descriptions carry an expression template in which placeholders are delimited by `<<`
//! and `>>`. Two placeholders are known:
//!
//! - `<<.Name>>` is replaced with the metric name of the selected series.
//! - `<<.Matchers>>` is replaced with a comma separated list of label matchers.
//!
//! For example, `sum(rate(<<.Name>>{<<.Matchers>>}[1m]))` renders to
//! `sum(rate(cpu{bench_replica="replica-00001"}[1m]))`.
//!
//! Templates are parsed once when the workload is loaded, so that unknown placeholders are
//! reported before the benchmark starts.

use thiserror::Error;

const OPEN: &str = "<<";
const CLOSE: &str = ">>";

/// Errors parsing an [`ExprTemplate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A `<<` without a matching `>>`.
    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),
    /// A placeholder other than `.Name` or `.Matchers`.
    #[error("unknown placeholder `{0}`, expected `.Name` or `.Matchers`")]
    UnknownPlaceholder(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Name,
    Matchers,
}

/// A parsed query expression template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExprTemplate {
    segments: Vec<Segment>,
}

impl ExprTemplate {
    /// Parses a template string.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }

            let inner = &rest[start + OPEN.len()..];
            let end = inner
                .find(CLOSE)
                .ok_or(TemplateError::Unterminated(offset + start))?;

            segments.push(match inner[..end].trim() {
                ".Name" => Segment::Name,
                ".Matchers" => Segment::Matchers,
                other => return Err(TemplateError::UnknownPlaceholder(other.to_owned())),
            });

            let consumed = start + OPEN.len() + end + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }

        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }

        Ok(Self { segments })
    }

    /// Renders the template for the given metric name and matcher list.
    pub fn render(&self, name: &str, matchers: &str) -> String {
        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(literal) => output.push_str(literal),
                Segment::Name => output.push_str(name),
                Segment::Matchers => output.push_str(matchers),
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_name_and_matchers() {
        let template = ExprTemplate::parse("sum(rate(<<.Name>>{<<.Matchers>>}[1m]))").unwrap();
        let rendered = template.render("cpu", r#"bench_replica="replica-00001""#);
        assert_eq!(rendered, r#"sum(rate(cpu{bench_replica="replica-00001"}[1m]))"#);
    }

    #[test]
    fn allows_whitespace_in_placeholders() {
        let template = ExprTemplate::parse("<< .Name >>").unwrap();
        assert_eq!(template.render("up", ""), "up");
    }

    #[test]
    fn plain_expression_renders_verbatim() {
        let template = ExprTemplate::parse("vector(1)").unwrap();
        assert_eq!(template.render("ignored", "ignored"), "vector(1)");
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = ExprTemplate::parse("<<.Labels>>").unwrap_err();
        assert_eq!(err, TemplateError::UnknownPlaceholder(".Labels".into()));
    }

    #[test]
    fn rejects_unterminated_placeholder() {
        let err = ExprTemplate::parse("rate(<<.Name>>[1m]) + <<.Name").unwrap_err();
        assert_eq!(err, TemplateError::Unterminated(22));
    }
}
