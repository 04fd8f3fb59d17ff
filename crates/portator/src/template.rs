//! Logic-less `{{tag}}` rendering for scaffold templates.
//!
//! Supported tags: `{{name}}` (HTML-escaped), `{{{name}}}` and `{{& name}}`
//! (verbatim), and `{{! comment}}`. Unknown variables render empty. Sections,
//! partials and delimiter changes are rejected.

use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    Unclosed { offset: usize },
    EmptyTag { offset: usize },
    Unsupported { tag: String, offset: usize },
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::Unclosed { offset } => write!(f, "unclosed tag at byte {offset}"),
            TemplateError::EmptyTag { offset } => write!(f, "empty tag at byte {offset}"),
            TemplateError::Unsupported { tag, offset } => {
                write!(f, "unsupported tag {{{{{tag}}}}} at byte {offset}")
            }
        }
    }
}

impl std::error::Error for TemplateError {}

#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    vars: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    fn get(&self, key: &str) -> &str {
        self.vars.get(key).map(String::as_str).unwrap_or("")
    }
}

const OPEN: &str = "{{";
const CLOSE: &str = "}}";
const TRIPLE_CLOSE: &str = "}}}";

pub fn render(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let tag_offset = offset + start;
        let after = &rest[start + OPEN.len()..];

        let (body, raw, consumed) = if let Some(inner) = after.strip_prefix('{') {
            let end = inner
                .find(TRIPLE_CLOSE)
                .ok_or(TemplateError::Unclosed { offset: tag_offset })?;
            (&inner[..end], true, OPEN.len() + 1 + end + TRIPLE_CLOSE.len())
        } else {
            let end = after
                .find(CLOSE)
                .ok_or(TemplateError::Unclosed { offset: tag_offset })?;
            (&after[..end], false, OPEN.len() + end + CLOSE.len())
        };

        let body = body.trim();
        if raw {
            out.push_str(ctx.get(body));
        } else if body.starts_with('!') {
            // comment
        } else if let Some(name) = body.strip_prefix('&') {
            out.push_str(ctx.get(name.trim()));
        } else if body.is_empty() {
            return Err(TemplateError::EmptyTag { offset: tag_offset });
        } else if body.starts_with(['#', '^', '/', '>', '=']) {
            return Err(TemplateError::Unsupported {
                tag: body.to_string(),
                offset: tag_offset,
            });
        } else {
            push_escaped(&mut out, ctx.get(body));
        }

        rest = &rest[start + consumed..];
        offset = tag_offset + consumed;
    }
    out.push_str(rest);
    Ok(out)
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext::new().with("name", "widget")
    }

    #[test]
    fn substitutes_variables() {
        let out = render("int {{name}}_main(void); /* {{ name }} */", &ctx()).unwrap();
        assert_eq!(out, "int widget_main(void); /* widget */");
    }

    #[test]
    fn escapes_unless_raw() {
        let c = TemplateContext::new().with("x", "<a&b>");
        assert_eq!(render("{{x}}", &c).unwrap(), "&lt;a&amp;b&gt;");
        assert_eq!(render("{{{x}}}|{{& x}}", &c).unwrap(), "<a&b>|<a&b>");
    }

    #[test]
    fn comments_and_unknown_variables_render_empty() {
        assert_eq!(render("a{{! note }}b{{missing}}c", &ctx()).unwrap(), "abc");
    }

    #[test]
    fn plain_braces_pass_through() {
        let src = "int main(void) { return 0; }\n";
        assert_eq!(render(src, &ctx()).unwrap(), src);
    }

    #[test]
    fn rejects_malformed_templates() {
        assert_eq!(
            render("x {{name", &ctx()),
            Err(TemplateError::Unclosed { offset: 2 })
        );
        assert!(matches!(
            render("{{#items}}{{/items}}", &ctx()),
            Err(TemplateError::Unsupported { .. })
        ));
        assert_eq!(
            render("{{  }}", &ctx()),
            Err(TemplateError::EmptyTag { offset: 0 })
        );
    }
}
