//! Command-template rendering with a closed placeholder set.
//!
//! Templates come from the target catalog and are rendered with explicit
//! substitution only: every `{placeholder}` must be one of the known names
//! and must have a value for the request at hand, otherwise rendering fails
//! closed. No environment interpolation, no nesting.

use std::collections::BTreeMap;
use thiserror::Error;

/// Placeholder names a template may reference.
pub const PLACEHOLDERS: &[&str] = &[
    "serial",
    "gdb_port",
    "telnet_port",
    "rtt_port",
    "print_port",
    "firmware_path",
    "device_path",
    "transport",
    "uart_baud",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template references unknown placeholder '{{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("no value for placeholder '{{{0}}}' in this request")]
    MissingValue(String),

    #[error("unbalanced '{{' in template at byte {0}")]
    Unbalanced(usize),
}

/// Values available to one render. Unset placeholders stay absent; the
/// render rejects any reference to them.
#[derive(Debug, Default)]
pub struct TemplateVars {
    values: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a placeholder value. `name` must be a member of [`PLACEHOLDERS`].
    pub fn set(&mut self, name: &'static str, value: impl ToString) -> &mut Self {
        debug_assert!(PLACEHOLDERS.contains(&name), "unknown placeholder {name}");
        self.values.insert(name, value.to_string());
        self
    }

    /// Set a placeholder only when a value is present.
    pub fn set_opt(&mut self, name: &'static str, value: Option<impl ToString>) -> &mut Self {
        if let Some(v) = value {
            self.set(name, v);
        }
        self
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Render `template` with `vars`, failing closed on any unknown or unset
/// placeholder. `{{` and `}}` escape literal braces.
pub fn render(template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        match c {
            '{' => {
                if matches!(chars.peek(), Some((_, '{'))) {
                    chars.next();
                    out.push('{');
                    continue;
                }
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    return Err(TemplateError::Unbalanced(pos));
                }
                if !PLACEHOLDERS.contains(&name.as_str()) {
                    return Err(TemplateError::UnknownPlaceholder(name));
                }
                match vars.get(&name) {
                    Some(value) => out.push_str(value),
                    None => return Err(TemplateError::MissingValue(name)),
                }
            }
            '}' => {
                if matches!(chars.peek(), Some((_, '}'))) {
                    chars.next();
                }
                out.push('}');
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

/// Placeholder names referenced by a template, in order of appearance.
/// Malformed templates yield whatever was parseable; [`render`] is the
/// authority on errors.
pub fn referenced_placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '{' {
            continue;
        }
        if matches!(chars.peek(), Some('{')) {
            chars.next();
            continue;
        }
        let mut name = String::new();
        for c in chars.by_ref() {
            if c == '}' {
                if !names.contains(&name) {
                    names.push(name);
                }
                break;
            }
            name.push(c);
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_placeholders() {
        let mut vars = TemplateVars::new();
        vars.set("serial", "S1").set("gdb_port", 3331u16);
        let out = render("JLinkGDBServer -select usb={serial} -port {gdb_port}", &vars).unwrap();
        assert_eq!(out, "JLinkGDBServer -select usb=S1 -port 3331");
    }

    #[test]
    fn missing_value_fails_closed() {
        let vars = TemplateVars::new();
        let err = render("openocd -c 'transport select {transport}'", &vars).unwrap_err();
        assert_eq!(err, TemplateError::MissingValue("transport".to_string()));
    }

    #[test]
    fn unknown_placeholder_fails_closed() {
        let mut vars = TemplateVars::new();
        vars.set("serial", "S1");
        let err = render("tool {serial} {home_dir}", &vars).unwrap_err();
        assert_eq!(
            err,
            TemplateError::UnknownPlaceholder("home_dir".to_string())
        );
    }

    #[test]
    fn unbalanced_brace_rejected() {
        let vars = TemplateVars::new();
        assert!(matches!(
            render("tool {serial", &vars),
            Err(TemplateError::Unbalanced(5))
        ));
    }

    #[test]
    fn escaped_braces_pass_through() {
        let vars = TemplateVars::new();
        let out = render("awk '{{print $1}}'", &vars).unwrap();
        assert_eq!(out, "awk '{print $1}'");
    }

    #[test]
    fn set_opt_skips_none() {
        let mut vars = TemplateVars::new();
        vars.set_opt("transport", None::<String>);
        assert!(render("x {transport}", &vars).is_err());
        vars.set_opt("transport", Some("swd"));
        assert_eq!(render("x {transport}", &vars).unwrap(), "x swd");
    }

    #[test]
    fn referenced_placeholders_in_order() {
        let refs =
            referenced_placeholders("a {serial} b {gdb_port} c {serial} {{literal}}");
        assert_eq!(refs, vec!["serial".to_string(), "gdb_port".to_string()]);
    }
}
