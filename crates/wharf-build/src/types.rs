//! Build specification and per-language defaults.

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};

/// Language value from older clients that asked the platform to guess.
pub const DETECT_LANGUAGE: &str = "detect";

/// How to turn a source tree into a runnable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Host port the application is published on.
    pub exposed_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
}

impl BuildSpec {
    /// A spec for `language` on `exposed_port` with no overrides.
    #[must_use]
    pub fn new(language: impl Into<String>, exposed_port: u16) -> Self {
        Self {
            language: Some(language.into()),
            exposed_port,
            runtime_image: None,
            build_command: None,
            start_command: None,
        }
    }

    #[must_use]
    pub fn with_runtime_image(mut self, image: impl Into<String>) -> Self {
        self.runtime_image = Some(image.into());
        self
    }

    #[must_use]
    pub fn with_build_command(mut self, command: impl Into<String>) -> Self {
        self.build_command = Some(command.into());
        self
    }

    #[must_use]
    pub fn with_start_command(mut self, command: impl Into<String>) -> Self {
        self.start_command = Some(command.into());
        self
    }

    /// Fill every unset field from the language defaults.
    ///
    /// Fields the caller set are kept as-is. Fails when the language asks for
    /// auto-detection, or when it is unknown and no runtime image was given.
    pub fn normalised(&self) -> BuildResult<Self> {
        let language = non_empty(self.language.as_deref());

        if language.is_some_and(|l| l.eq_ignore_ascii_case(DETECT_LANGUAGE)) {
            return Err(BuildError::configuration(
                "Auto-detection is no longer supported. Please specify a language.",
            ));
        }

        let defaults = language.and_then(LanguageDefaults::for_language);
        let runtime_image = non_empty(self.runtime_image.as_deref());

        if defaults.is_none() && runtime_image.is_none() {
            return Err(BuildError::configuration(format!(
                "Unsupported language '{}' and no runtime image provided.",
                language.unwrap_or_default()
            )));
        }

        let fill = |own: Option<&str>, default: Option<&'static str>| {
            non_empty(own).or(default).map(str::to_owned)
        };

        Ok(Self {
            language: language.map(str::to_owned),
            exposed_port: self.exposed_port,
            runtime_image: fill(runtime_image, defaults.map(|d| d.runtime_image)),
            build_command: fill(
                self.build_command.as_deref(),
                defaults.map(|d| d.build_command),
            ),
            start_command: fill(
                self.start_command.as_deref(),
                defaults.map(|d| d.start_command),
            ),
        })
    }
}

/// Default image and commands for a supported language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageDefaults {
    pub runtime_image: &'static str,
    pub build_command: &'static str,
    pub start_command: &'static str,
}

const NODE: LanguageDefaults = LanguageDefaults {
    runtime_image: "node:18",
    build_command: "npm install",
    start_command: "npm start",
};

const PYTHON: LanguageDefaults = LanguageDefaults {
    runtime_image: "python:3.9",
    build_command: "pip install -r requirements.txt",
    start_command: "python app.py",
};

impl LanguageDefaults {
    /// Defaults for `language`, matched case-insensitively.
    #[must_use]
    pub fn for_language(language: &str) -> Option<Self> {
        match language.to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "javascript" => Some(NODE),
            "python" => Some(PYTHON),
            _ => None,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
