// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-processing steps applied to the events of every transaction before
//! it is serialized.
//!
//! A step only rewrites an event's payload; it never touches the name or the
//! timing, and applying it twice gives the same result as applying it once.
//! The chain is composed once at startup from [`Capabilities`].

use std::path::Path;

use serde_json::Value;

use crate::config::Config;
use crate::event::Event;

pub trait PostProcessingStep: Send + Sync {
    fn name(&self) -> &'static str;

    fn call(&self, event: &mut Event);
}

/// Drops payload entries that are null, empty strings, empty arrays or empty
/// objects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteBlanks;

impl PostProcessingStep for DeleteBlanks {
    fn name(&self) -> &'static str {
        "delete_blanks"
    }

    fn call(&self, event: &mut Event) {
        event.payload.retain(|_, value| !is_blank(value));
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Strips the application root from the `identifier` of rendered views, so
/// `/srv/app/app/views/home.html` becomes `app/views/home.html`.
#[derive(Debug, Clone)]
pub struct ViewPathSanitizer {
    root: String,
}

impl ViewPathSanitizer {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        ViewPathSanitizer {
            root: root.to_string_lossy().trim_end_matches('/').to_string(),
        }
    }
}

impl PostProcessingStep for ViewPathSanitizer {
    fn name(&self) -> &'static str {
        "view_path_sanitizer"
    }

    fn call(&self, event: &mut Event) {
        if self.root.is_empty() {
            return;
        }
        let Some(Value::String(identifier)) = event.payload.get_mut("identifier") else {
            return;
        };
        let stripped = match identifier.strip_prefix(self.root.as_str()) {
            Some(rest) if rest.starts_with('/') => rest.trim_start_matches('/').to_string(),
            _ => return,
        };
        *identifier = stripped;
    }
}

/// Removes ORM-internal entries that identify the connection or carry raw
/// bind values.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrmSanitizer;

pub const ORM_INTERNAL_KEYS: [&str; 2] = ["connection_id", "binds"];

impl PostProcessingStep for OrmSanitizer {
    fn name(&self) -> &'static str {
        "orm_sanitizer"
    }

    fn call(&self, event: &mut Event) {
        for key in ORM_INTERNAL_KEYS {
            event.payload.remove(key);
        }
    }
}

/// Which host libraries the optional steps apply to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub views: bool,
    pub orm: bool,
}

impl Capabilities {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Capabilities {
            views: config.enable_view_sanitizer,
            orm: config.enable_orm_sanitizer,
        }
    }
}

#[derive(Default)]
pub struct MiddlewareChain {
    steps: Vec<Box<dyn PostProcessingStep>>,
}

impl MiddlewareChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `DeleteBlanks`, plus the view and ORM steps when enabled.
    #[must_use]
    pub fn default_chain(capabilities: Capabilities, root: &Path) -> Self {
        let mut chain = MiddlewareChain::new();
        chain.add(Box::new(DeleteBlanks));
        if capabilities.views {
            chain.add(Box::new(ViewPathSanitizer::new(root)));
        }
        if capabilities.orm {
            chain.add(Box::new(OrmSanitizer));
        }
        chain
    }

    pub fn add(&mut self, step: Box<dyn PostProcessingStep>) {
        self.steps.push(step);
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.steps.iter().any(|step| step.name() == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn invoke(&self, event: &mut Event) {
        for step in &self.steps {
            step.call(event);
        }
    }
}
