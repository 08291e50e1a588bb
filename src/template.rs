//! Email body templates.
//!
//! Templates are plain text or HTML with `{{ name }}` placeholders. The
//! registry is filled at startup from the built-in templates, a template
//! directory (`<name>.html` / `<name>.txt`) and inline config entries, in
//! that order, later sources overriding earlier ones.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::{debug, info};

/// Template used for subscription verification mails.
pub const VERIFICATION_TEMPLATE: &str = "email-subscription-verification";

const VERIFICATION_BODY: &str = r#"<html>
<body>
<p>Thanks for subscribing!</p>
<p>Please confirm your email address by following this link:</p>
<p><a href="{{ verificationLink }}">Confirm my subscription</a></p>
<p>If you did not request this, you can ignore this message.</p>
</body>
</html>
"#;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("template '{template}' requires parameter '{parameter}'")]
    MissingParameter { template: String, parameter: String },

    #[error("failed to read template directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Renders a named template with string parameters.
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, name: &str, params: &HashMap<String, String>) -> Result<String, TemplateError>;
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Named templates held in memory.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, String>,
}

impl TemplateRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in templates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.insert(VERIFICATION_TEMPLATE, VERIFICATION_BODY);
        registry
    }

    pub fn insert(&mut self, name: impl Into<String>, body: impl Into<String>) {
        self.templates.insert(name.into(), body.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Load every `*.html` and `*.txt` file in `dir`, named by file stem.
    ///
    /// Returns the number of templates loaded.
    pub fn load_dir<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize, TemplateError> {
        let dir = dir.as_ref();
        let mut loaded = 0;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_template = matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("html") | Some("txt")
            );
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if !is_template {
                continue;
            }

            debug!(template = %name, path = %path.display(), "Loading template");
            self.insert(name, fs::read_to_string(&path)?);
            loaded += 1;
        }

        info!(dir = %dir.display(), loaded = loaded, "Templates loaded");
        Ok(loaded)
    }
}

impl TemplateRenderer for TemplateRegistry {
    fn render(&self, name: &str, params: &HashMap<String, String>) -> Result<String, TemplateError> {
        let body = self
            .templates
            .get(name)
            .ok_or_else(|| TemplateError::NotFound(name.to_string()))?;

        if let Some(missing) = placeholder()
            .captures_iter(body)
            .map(|caps| caps[1].to_string())
            .find(|parameter| !params.contains_key(parameter))
        {
            return Err(TemplateError::MissingParameter {
                template: name.to_string(),
                parameter: missing,
            });
        }

        Ok(placeholder()
            .replace_all(body, |caps: &Captures| params[&caps[1]].clone())
            .into_owned())
    }
}
