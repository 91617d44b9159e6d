//! `${var}` placeholders in SQL text, URLs, headers and request bodies.
//!
//! A placeholder is either a bare variable, `${region}`, or a variable passed
//! through one template function, `${upper(region)}`. Variables resolve
//! against published results first and request parameters second; the
//! resolution itself is supplied by the caller.

use arbor_error::{ArborError, ErrorCode, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

static IDENT_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static CALL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\(\s*([A-Za-z_][A-Za-z0-9_]*)\s*\)$").unwrap()
});

pub(crate) fn is_identifier(s: &str) -> bool {
    IDENT_REGEX.is_match(s)
}

/// Functions a placeholder may apply to its variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFunction {
    Upper,
    Lower,
    Trim,
    /// Compact JSON of the value, strings included (quoted).
    Json,
    /// `application/x-www-form-urlencoded` escaping, for URL segments.
    UrlEncode,
}

impl TemplateFunction {
    pub const ALL: [TemplateFunction; 5] = [
        TemplateFunction::Upper,
        TemplateFunction::Lower,
        TemplateFunction::Trim,
        TemplateFunction::Json,
        TemplateFunction::UrlEncode,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TemplateFunction::Upper => "upper",
            TemplateFunction::Lower => "lower",
            TemplateFunction::Trim => "trim",
            TemplateFunction::Json => "json",
            TemplateFunction::UrlEncode => "urlencode",
        }
    }

    pub fn apply(&self, value: &Value) -> Value {
        match self {
            TemplateFunction::Upper => Value::String(value_to_text(value).to_uppercase()),
            TemplateFunction::Lower => Value::String(value_to_text(value).to_lowercase()),
            TemplateFunction::Trim => Value::String(value_to_text(value).trim().to_string()),
            TemplateFunction::Json => Value::String(value.to_string()),
            TemplateFunction::UrlEncode => Value::String(
                url::form_urlencoded::byte_serialize(value_to_text(value).as_bytes()).collect(),
            ),
        }
    }
}

impl FromStr for TemplateFunction {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        TemplateFunction::ALL
            .iter()
            .copied()
            .find(|f| f.name() == s)
            .ok_or_else(|| {
                let known: Vec<String> = TemplateFunction::ALL
                    .iter()
                    .map(|f| f.name().to_string())
                    .collect();
                let mut err = ArborError::new(
                    ErrorCode::InvalidPlan,
                    format!("Unknown template function '{}'", s),
                );
                if let Some(suggestion) = arbor_error::find_closest_match(s, &known) {
                    err = err.with_hint(format!("Did you mean '{}'?", suggestion));
                }
                err
            })
    }
}

impl fmt::Display for TemplateFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Text form of a value when spliced into a string: strings verbatim, null
/// as empty, everything else as compact JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Var {
        name: String,
        function: Option<TemplateFunction>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = text;

        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                ArborError::new(
                    ErrorCode::InvalidPlan,
                    format!("Unterminated placeholder in '{}'", text),
                )
            })?;
            segments.push(parse_placeholder(after[..end].trim())?);
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Variables referenced, in order of appearance, duplicates included.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var { name, .. } => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    pub fn functions(&self) -> impl Iterator<Item = TemplateFunction> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var { function, .. } => *function,
            Segment::Text(_) => None,
        })
    }

    pub fn is_static(&self) -> bool {
        self.variables().next().is_none()
    }

    /// Splice resolved values into the text.
    pub fn render<F>(&self, mut resolve: F) -> Result<String>
    where
        F: FnMut(&str) -> Result<Value>,
    {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var { name, function } => {
                    let value = apply(function, resolve(name)?);
                    out.push_str(&value_to_text(&value));
                }
            }
        }
        Ok(out)
    }

    /// Replace each placeholder with `?` and return the values to bind, in order.
    ///
    /// Values are never spliced into the text, so SQL built this way is not
    /// open to injection through parameters.
    pub fn bind<F>(&self, mut resolve: F) -> Result<(String, Vec<Value>)>
    where
        F: FnMut(&str) -> Result<Value>,
    {
        let mut sql = String::new();
        let mut binds = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => sql.push_str(text),
                Segment::Var { name, function } => {
                    binds.push(apply(function, resolve(name)?));
                    sql.push('?');
                }
            }
        }
        Ok((sql, binds))
    }
}

fn apply(function: &Option<TemplateFunction>, value: Value) -> Value {
    match function {
        Some(f) => f.apply(&value),
        None => value,
    }
}

fn parse_placeholder(inner: &str) -> Result<Segment> {
    if is_identifier(inner) {
        return Ok(Segment::Var {
            name: inner.to_string(),
            function: None,
        });
    }
    if let Some(caps) = CALL_REGEX.captures(inner) {
        let function = caps[1].parse::<TemplateFunction>()?;
        return Ok(Segment::Var {
            name: caps[2].to_string(),
            function: Some(function),
        });
    }
    Err(ArborError::new(
        ErrorCode::InvalidPlan,
        format!("Malformed placeholder '${{{}}}'", inner),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a HashMap<&'a str, Value>) -> impl FnMut(&str) -> Result<Value> + 'a {
        move |name: &str| {
            vars.get(name).cloned().ok_or_else(|| {
                ArborError::new(ErrorCode::ParameterUnresolved, format!("'{}'", name))
            })
        }
    }

    #[test]
    fn test_bind_positional() {
        let t = Template::parse("SELECT * FROM t WHERE a = ${a} AND b = ${b} AND c = ${a}")
            .unwrap();
        let vars = HashMap::from([("a", json!(1)), ("b", json!("x"))]);
        let (sql, binds) = t.bind(lookup(&vars)).unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE a = ? AND b = ? AND c = ?");
        assert_eq!(binds, vec![json!(1), json!("x"), json!(1)]);
    }

    #[test]
    fn test_render_with_functions() {
        let t = Template::parse("/api/${lower(region)}/items?q=${urlencode(q)}&n=${n}").unwrap();
        let vars = HashMap::from([
            ("region", json!("EU")),
            ("q", json!("a b&c")),
            ("n", json!(3)),
        ]);
        assert_eq!(
            t.render(lookup(&vars)).unwrap(),
            "/api/eu/items?q=a+b%26c&n=3"
        );
        assert_eq!(
            t.functions().collect::<Vec<_>>(),
            vec![TemplateFunction::Lower, TemplateFunction::UrlEncode]
        );
    }

    #[test]
    fn test_static_text_and_bare_dollar() {
        let t = Template::parse("SELECT '$5' AS price").unwrap();
        assert!(t.is_static());
        let (sql, binds) = t.bind(|_| unreachable!()).unwrap();
        assert_eq!(sql, "SELECT '$5' AS price");
        assert!(binds.is_empty());
    }

    #[test]
    fn test_unresolved_variable_propagates() {
        let t = Template::parse("${missing}").unwrap();
        let vars = HashMap::new();
        let err = t.render(lookup(&vars)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ParameterUnresolved);
    }

    #[test]
    fn test_malformed_placeholders() {
        assert_eq!(
            Template::parse("SELECT ${a").unwrap_err().code,
            ErrorCode::InvalidPlan
        );
        assert_eq!(
            Template::parse("${1abc}").unwrap_err().code,
            ErrorCode::InvalidPlan
        );
        let err = Template::parse("${uper(a)}").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidPlan);
        assert_eq!(err.hint.as_deref(), Some("Did you mean 'upper'?"));
    }
}
