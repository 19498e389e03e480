//! String templating over the run context
//!
//! Replaces `{{dot.path}}` tokens with stringified context values. Unresolved
//! paths render as the empty string.

use regex::Regex;

use crate::condition::{lookup_path, stringify};
use crate::Context;

pub struct TemplateRenderer {
    token: Regex,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self {
            // Paths are dot-separated identifiers; whitespace inside the
            // braces is tolerated.
            token: Regex::new(r"\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}")
                .expect("template token pattern is valid"),
        }
    }

    /// Substitute every `{{path}}` occurrence from the context.
    pub fn render(&self, template: &str, context: &Context) -> String {
        self.token
            .replace_all(template, |captures: &regex::Captures<'_>| {
                lookup_path(context, &captures[1])
                    .map(stringify)
                    .unwrap_or_default()
            })
            .into_owned()
    }
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(value: serde_json::Value) -> Context {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_renders_nested_path() {
        let renderer = TemplateRenderer::new();
        let ctx = context(json!({"user": {"name": "Ann"}}));

        assert_eq!(renderer.render("Hi {{user.name}}", &ctx), "Hi Ann");
    }

    #[test]
    fn test_unresolved_path_renders_empty() {
        let renderer = TemplateRenderer::new();
        let ctx = context(json!({"user": {}}));

        assert_eq!(renderer.render("Hi {{user.name}}!", &ctx), "Hi !");
    }

    #[test]
    fn test_multiple_tokens_and_non_strings() {
        let renderer = TemplateRenderer::new();
        let ctx = context(json!({"order": {"id": 42, "total": 19.5}}));

        assert_eq!(
            renderer.render("Order {{order.id}}: {{ order.total }}", &ctx),
            "Order 42: 19.5"
        );
    }

    #[test]
    fn test_plain_text_untouched() {
        let renderer = TemplateRenderer::new();
        assert_eq!(renderer.render("no tokens here", &Context::new()), "no tokens here");
    }
}
