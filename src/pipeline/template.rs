//! Prompt template filling.
//!
//! Templates are plain text with `{{NAME}}` placeholders. Filling is a pure
//! string operation; any placeholder left unresolved after substitution is
//! an error, so a renamed variable in a template cannot silently reach the
//! model.

use anyhow::{Result, bail};

/// Replace each `{{NAME}}` with its value and reject leftovers.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut filled = template.to_string();
    for (name, value) in vars {
        filled = filled.replace(&format!("{{{{{name}}}}}"), value);
    }
    if let Some(unresolved) = find_placeholder(&filled) {
        bail!("unresolved template placeholder: {{{{{unresolved}}}}}");
    }
    Ok(filled)
}

/// First `{{NAME}}`-shaped placeholder remaining, if any. Only uppercase
/// names with underscores count; JSON braces in substituted values do not.
fn find_placeholder(text: &str) -> Option<&str> {
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        if let Some(end) = after.find("}}") {
            let name = &after[..end];
            if !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
            {
                return Some(name);
            }
            rest = &after[end + 2..];
        } else {
            return None;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_placeholders() {
        let out = fill(
            "Describe: {{UI_DESCRIPTION}} against {{AGENT_OUTPUT}}",
            &[
                ("UI_DESCRIPTION", "a table"),
                ("AGENT_OUTPUT", "{\"type\":\"Table\"}"),
            ],
        )
        .unwrap();
        assert_eq!(out, "Describe: a table against {\"type\":\"Table\"}");
    }

    #[test]
    fn repeated_placeholder_is_replaced_everywhere() {
        let out = fill("{{X1}} and {{X1}}", &[("X1", "v")]).unwrap();
        assert_eq!(out, "v and v");
    }

    #[test]
    fn unresolved_placeholder_is_rejected() {
        let err = fill("hello {{INTENDED_JSON}}", &[("UI_DESCRIPTION", "x")]).unwrap_err();
        assert!(err.to_string().contains("INTENDED_JSON"));
    }

    #[test]
    fn json_braces_in_values_are_not_placeholders() {
        let out = fill(
            "payload: {{PAYLOAD}}",
            &[("PAYLOAD", r#"{{"nested": {"deep": 1}}}"#)],
        )
        .unwrap();
        assert!(out.contains("nested"));
    }

    #[test]
    fn lowercase_braces_pass_through() {
        let out = fill("code {{not_a_var}} sample", &[]).unwrap();
        assert_eq!(out, "code {{not_a_var}} sample");
    }
}
