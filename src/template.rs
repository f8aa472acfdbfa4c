// Template Rendering
// Renders `{{ .Variable }}` placeholders against a variables snapshot.
// A missing variable is a fatal render error.

use std::collections::HashMap;

use handlebars::Handlebars;

use crate::error::{Error, Result};
use crate::variables::Variables;

/// Render a template string against the given variables. Every value is
/// coerced to its string form before rendering.
pub fn render_string(template: &str, vars: &Variables) -> Result<String> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    render_map(template, &vars.string_map())
}

/// Render against a plain string map.
pub fn render_map(template: &str, data: &HashMap<String, String>) -> Result<String> {
    if !template.contains("{{") {
        return Ok(template.to_string());
    }

    let normalized = normalize_dot_paths(template);

    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry
        .render_template(&normalized, data)
        .map_err(|e| Error::Render(e.to_string()))
}

/// Placeholders use member-style paths (`{{ .Name }}`); strip the leading dot
/// so the engine resolves them as plain identifiers.
fn normalize_dot_paths(template: &str) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '{' && i + 1 < chars.len() && chars[i + 1] == '{' {
            out.push_str("{{");
            i += 2;
            // skip whitespace between the braces and the path
            while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
                out.push(chars[i]);
                i += 1;
            }
            if i < chars.len() && chars[i] == '.' {
                i += 1;
            }
            continue;
        }
        out.push(chars[i]);
        i += 1;
    }

    out
}
