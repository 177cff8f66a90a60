//! Small template engine used to render command line arguments, stdin
//! content, input files, and hook script bodies from fuzz variable values.
//!
//! The syntax is limited to variable substitution with an optional named
//! filter: `{{ name }}`, `{{ name | quote }}`, `{{ host | gethostbyname }}`.
//! Templates are compiled once when a project is loaded and rendered once per
//! trace with the concrete variable values plus a handful of builtin
//! variables (`trace_dir`, `binary`, `engine`, `context_id`).

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("unterminated substitution starting at offset {0}")]
    UnterminatedSubstitution(usize),
    #[error("empty substitution at offset {0}")]
    EmptySubstitution(usize),
    #[error("unknown filter: {0}")]
    UnknownFilter(String),
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    #[error("failed to resolve hostname {0}: {1}")]
    HostResolution(String, String),
    #[error("unbalanced quote in argument string: {0}")]
    UnbalancedQuote(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Filter {
    Quote,
    GetHostByName,
}

impl Filter {
    fn parse(name: &str) -> Result<Filter, RenderError> {
        match name {
            "quote" => Ok(Filter::Quote),
            "gethostbyname" => Ok(Filter::GetHostByName),
            other => Err(RenderError::UnknownFilter(other.to_string())),
        }
    }

    fn apply(&self, value: &str) -> Result<String, RenderError> {
        match self {
            Filter::Quote => Ok(shell_quote(value)),
            Filter::GetHostByName => resolve_hostname(value),
        }
    }
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Subst { variable: String, filter: Option<Filter> },
}

/// A compiled template. Compiling validates the substitution syntax and
/// filter names so that rendering can only fail on missing variables or
/// filter evaluation.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Template, RenderError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            literal.push_str(&rest[..start]);
            let subst_offset = offset + start;
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(RenderError::UnterminatedSubstitution(subst_offset))?;

            let body = after[..end].trim();
            if body.is_empty() {
                return Err(RenderError::EmptySubstitution(subst_offset));
            }

            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let (variable, filter) = match body.split_once('|') {
                Some((name, filter)) => (name.trim(), Some(Filter::parse(filter.trim())?)),
                None => (body, None),
            };
            segments.push(Segment::Subst {
                variable: variable.to_string(),
                filter,
            });

            offset = subst_offset + 2 + end + 2;
            rest = &after[end + 2..];
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Template {
            source: source.to_string(),
            segments,
        })
    }

    /// The original template source.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, variables: &HashMap<String, String>) -> Result<String, RenderError> {
        let mut output = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Subst { variable, filter } => {
                    let value = variables
                        .get(variable)
                        .ok_or_else(|| RenderError::UnknownVariable(variable.clone()))?;
                    match filter {
                        Some(filter) => output.push_str(&filter.apply(value)?),
                        None => output.push_str(value),
                    }
                }
            }
        }
        Ok(output)
    }
}

/// Quote a string so it is treated as a single shell word.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }

    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

fn resolve_hostname(host: &str) -> Result<String, RenderError> {
    let addrs = (host, 0u16)
        .to_socket_addrs()
        .map_err(|err| RenderError::HostResolution(host.to_string(), err.to_string()))?;

    let mut fallback = None;
    for addr in addrs {
        match addr {
            SocketAddr::V4(v4) => return Ok(v4.ip().to_string()),
            SocketAddr::V6(v6) => fallback = Some(v6.ip().to_string()),
        }
    }

    fallback.ok_or_else(|| {
        RenderError::HostResolution(host.to_string(), "no addresses returned".to_string())
    })
}

/// Split a rendered argument string into individual arguments, honoring
/// single quotes, double quotes, and backslash escapes.
pub fn split_arguments(line: &str) -> Result<Vec<String>, RenderError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(other) => current.push(other),
                        None => return Err(RenderError::UnbalancedQuote(line.to_string())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(RenderError::UnbalancedQuote(line.to_string())),
                        },
                        Some(other) => current.push(other),
                        None => return Err(RenderError::UnbalancedQuote(line.to_string())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => return Err(RenderError::UnbalancedQuote(line.to_string())),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }

    if in_word {
        args.push(current);
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn render_literal_only() {
        let template = Template::compile("--help").unwrap();
        assert_eq!(template.render(&vars(&[])).unwrap(), "--help");
    }

    #[test]
    fn render_substitutes_variables() {
        let template = Template::compile("-n {{count}} {{ file }}").unwrap();
        let rendered = template
            .render(&vars(&[("count", "3"), ("file", "input.txt")]))
            .unwrap();
        assert_eq!(rendered, "-n 3 input.txt");
    }

    #[test]
    fn render_quote_filter() {
        let template = Template::compile("--value {{name | quote}}").unwrap();
        let rendered = template.render(&vars(&[("name", "has spaces")])).unwrap();
        assert_eq!(rendered, "--value 'has spaces'");
    }

    #[test]
    fn render_unknown_variable_is_an_error() {
        let template = Template::compile("{{missing}}").unwrap();
        let err = template.render(&vars(&[])).unwrap_err();
        assert!(matches!(err, RenderError::UnknownVariable(name) if name == "missing"));
    }

    #[test]
    fn compile_rejects_unknown_filter() {
        let err = Template::compile("{{x | upper}}").unwrap_err();
        assert!(matches!(err, RenderError::UnknownFilter(name) if name == "upper"));
    }

    #[test]
    fn compile_rejects_unterminated_substitution() {
        let err = Template::compile("prefix {{x").unwrap_err();
        assert!(matches!(err, RenderError::UnterminatedSubstitution(7)));
    }

    #[test]
    fn gethostbyname_resolves_localhost() {
        let template = Template::compile("{{host | gethostbyname}}").unwrap();
        let rendered = template.render(&vars(&[("host", "localhost")])).unwrap();
        assert_eq!(rendered, "127.0.0.1");
    }

    #[test]
    fn quote_passes_safe_strings_through() {
        assert_eq!(shell_quote("simple-value_1.txt"), "simple-value_1.txt");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn split_plain_arguments() {
        assert_eq!(
            split_arguments("-n 3 input.txt").unwrap(),
            vec!["-n", "3", "input.txt"]
        );
    }

    #[test]
    fn split_quoted_arguments() {
        assert_eq!(
            split_arguments("--value 'has spaces' \"double $x\" tail").unwrap(),
            vec!["--value", "has spaces", "double $x", "tail"]
        );
    }

    #[test]
    fn split_empty_string() {
        assert!(split_arguments("").unwrap().is_empty());
        assert!(split_arguments("   ").unwrap().is_empty());
    }

    #[test]
    fn split_unbalanced_quote_is_an_error() {
        assert!(matches!(
            split_arguments("'oops"),
            Err(RenderError::UnbalancedQuote(_))
        ));
    }
}
