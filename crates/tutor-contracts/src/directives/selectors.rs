use super::registry::{DirectiveRegistry, DirectiveSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveSelection {
    pub directive: DirectiveSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DirectiveSelector {
    pub registry: DirectiveRegistry,
}

impl DirectiveSelector {
    pub fn new(registry: Option<DirectiveRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn select(&self, requested: Option<&str>) -> Result<DirectiveSelection, String> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let fallback_reason = if let Some(requested_value) = requested {
            if let Some(directive) = self.registry.get(requested_value) {
                return Ok(DirectiveSelection {
                    directive: directive.clone(),
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            format!("Requested directive '{requested_value}' unknown; using default.")
        } else {
            "No directive specified; using default.".to_string()
        };

        let Some(directive) = self.registry.default_directive().cloned() else {
            return Err("No directives registered.".to_string());
        };
        Ok(DirectiveSelection {
            directive,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        })
    }
}
