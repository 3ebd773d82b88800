//! Template engine implementation using minijinja.

use minijinja::{Environment, Value};
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use crate::context::{RunContext, BUILTIN_TEMPLATE_VARIABLES};
use crate::error::ToolError;

/// Template engine for SQL query templates.
///
/// Table placeholders are written `{{ name }}` and render to quoted
/// identifiers. Jinja control flow works as usual.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with the `sqlquote` filter.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_filter("sqlquote", filter_sqlquote);

        Self { env }
    }

    /// Render a template string with the given context.
    pub fn render(
        &self,
        template: &str,
        context: &HashMap<String, serde_json::Value>,
    ) -> Result<String, ToolError> {
        let tmpl = self.env.template_from_str(template)?;

        let ctx = context_to_value(context);

        tmpl.render(ctx).map_err(|e| ToolError::Template(e.to_string()))
    }

    /// Render with the run's built-in variables plus `bindings`.
    pub fn render_with_context(
        &self,
        template: &str,
        ctx: &RunContext,
        bindings: &HashMap<String, serde_json::Value>,
    ) -> Result<String, ToolError> {
        let mut vars = ctx.template_variables();
        vars.extend(bindings.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.render(template, &vars)
    }

    /// Names referenced as `{{ name ... }}` expressions, in sorted order.
    pub fn placeholders(template: &str) -> BTreeSet<String> {
        placeholder_regex()
            .captures_iter(template)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Verify that placeholders and bindings agree.
    ///
    /// Every binding must be referenced at least once, and every referenced
    /// name must be bound or be one of the run's built-in variables.
    pub fn check_bindings<'a>(
        template: &str,
        bound: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ToolError> {
        let referenced = Self::placeholders(template);
        let bound: BTreeSet<&str> = bound.into_iter().collect();

        let unused: Vec<&str> = bound
            .iter()
            .copied()
            .filter(|name| !referenced.contains(*name))
            .collect();
        if !unused.is_empty() {
            return Err(ToolError::UnboundPlaceholder(format!(
                "binding(s) never referenced in query: {}",
                unused.join(", ")
            )));
        }

        let missing: Vec<&str> = referenced
            .iter()
            .map(|s| s.as_str())
            .filter(|name| !bound.contains(name) && !BUILTIN_TEMPLATE_VARIABLES.contains(name))
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::UnboundPlaceholder(format!(
                "placeholder(s) without a binding: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_]*)").expect("placeholder regex is valid")
    })
}

/// Convert a HashMap context to minijinja Value.
fn context_to_value(context: &HashMap<String, serde_json::Value>) -> Value {
    let json = serde_json::Value::Object(
        context
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    Value::from_serialize(&json)
}

/// Render a value as a single-quoted SQL string literal.
fn filter_sqlquote(value: Value) -> String {
    crate::warehouse::quote_literal(&value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use chrono::NaiveDate;
    use std::sync::Arc;

    const JOIN: &str = "SELECT c.customer_id, customer_name, order_id, purchase_date, amount, type
    FROM {{filtered_orders_table}} f JOIN {{customers_table}} c
    ON f.customer_id = c.customer_id";

    #[test]
    fn test_simple_template() {
        let engine = TemplateEngine::new();
        let mut ctx = HashMap::new();
        ctx.insert("input_table".to_string(), serde_json::json!("\"orders\""));

        let result = engine
            .render("SELECT * FROM {{input_table}} WHERE amount > 150", &ctx)
            .unwrap();
        assert_eq!(result, "SELECT * FROM \"orders\" WHERE amount > 150");
    }

    #[test]
    fn test_placeholders() {
        let found = TemplateEngine::placeholders(JOIN);
        assert_eq!(
            found.into_iter().collect::<Vec<_>>(),
            vec!["customers_table", "filtered_orders_table"]
        );
        assert!(TemplateEngine::placeholders("SELECT 1").is_empty());
        assert_eq!(
            TemplateEngine::placeholders("{{- t | sqlquote }} {{ t }}").len(),
            1
        );
    }

    #[test]
    fn test_check_bindings_ok() {
        assert!(
            TemplateEngine::check_bindings(JOIN, ["filtered_orders_table", "customers_table"])
                .is_ok()
        );
        // built-ins need no binding
        assert!(TemplateEngine::check_bindings(
            "SELECT * FROM {{t}} WHERE day = {{ ds | sqlquote }}",
            ["t"]
        )
        .is_ok());
    }

    #[test]
    fn test_check_bindings_unused() {
        let err = TemplateEngine::check_bindings(
            "SELECT * FROM {{input_table}}",
            ["input_table", "customers_table"],
        )
        .unwrap_err();
        assert!(matches!(err, ToolError::UnboundPlaceholder(_)));
        assert!(err.to_string().contains("customers_table"));
    }

    #[test]
    fn test_check_bindings_missing() {
        let err = TemplateEngine::check_bindings(JOIN, ["filtered_orders_table"]).unwrap_err();
        assert!(matches!(err, ToolError::UnboundPlaceholder(_)));
        assert!(err.to_string().contains("customers_table"));
    }

    #[test]
    fn test_filter_sqlquote() {
        let engine = TemplateEngine::new();
        let mut ctx = HashMap::new();
        ctx.insert("name".to_string(), serde_json::json!("O'Brien"));
        let result = engine.render("{{ name | sqlquote }}", &ctx).unwrap();
        assert_eq!(result, "'O''Brien'");
    }

    #[test]
    fn test_render_with_context() {
        let engine = TemplateEngine::new();
        let ctx = RunContext::new(
            "run-7",
            "astro_orders",
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            Arc::new(ConnectionRegistry::new()),
        );
        let mut bindings = HashMap::new();
        bindings.insert("t".to_string(), serde_json::json!("\"orders\""));

        let result = engine
            .render_with_context("SELECT '{{ ds }}' FROM {{ t }}", &ctx, &bindings)
            .unwrap();
        assert_eq!(result, "SELECT '2022-01-01' FROM \"orders\"");
    }

    #[test]
    fn test_conditional() {
        let engine = TemplateEngine::new();
        let mut ctx = HashMap::new();
        ctx.insert("full".to_string(), serde_json::json!(false));

        let result = engine
            .render("SELECT *{% if not full %} LIMIT 10{% endif %}", &ctx)
            .unwrap();
        assert_eq!(result, "SELECT * LIMIT 10");
    }
}
