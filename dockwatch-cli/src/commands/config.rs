//! `dockwatch config`

use std::io::Write;
use std::path::Path;

use serde::Serialize;
use tracing::info;

use dockwatch_core::DockwatchConfig;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::commands::load_config;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

const SECTIONS: [&str; 6] = ["general", "docker", "scan", "policy", "registry", "metrics"];
const REDACTED: &str = "***REDACTED***";

pub async fn execute(args: ConfigArgs, config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => execute_validate(config_path, writer).await,
        ConfigAction::Show { section } => execute_show(config_path, section.as_deref(), writer).await,
    }
}

async fn execute_validate(config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    info!(path = %config_path.display(), "validating configuration");

    let report = match load_config(config_path).await {
        Ok(_) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: true,
            errors: Vec::new(),
        },
        Err(e) => ConfigValidationReport {
            source: config_path.display().to_string(),
            valid: false,
            errors: vec![e.to_string()],
        },
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

async fn execute_show(
    config_path: &Path,
    section: Option<&str>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let mut config = load_config(config_path).await?;
    redact_credentials(&mut config);
    let report = build_report(config_path.display().to_string(), &config, section)?;
    writer.render(&report)
}

/// Blanks every registry token.
pub fn redact_credentials(config: &mut DockwatchConfig) {
    for auth in &mut config.registry.auth {
        if !auth.token.is_empty() {
            auth.token = REDACTED.to_owned();
        }
    }
}

pub fn build_report(
    source: String,
    config: &DockwatchConfig,
    section: Option<&str>,
) -> Result<ConfigReport, CliError> {
    let (value, toml_text) = match section {
        None => (serde_json::to_value(config)?, to_toml(config)),
        Some("general") => (serde_json::to_value(&config.general)?, to_toml(&config.general)),
        Some("docker") => (serde_json::to_value(&config.docker)?, to_toml(&config.docker)),
        Some("scan") => (serde_json::to_value(&config.scan)?, to_toml(&config.scan)),
        Some("policy") => (serde_json::to_value(&config.policy)?, to_toml(&config.policy)),
        Some("registry") => (serde_json::to_value(&config.registry)?, to_toml(&config.registry)),
        Some("metrics") => (serde_json::to_value(&config.metrics)?, to_toml(&config.metrics)),
        Some(other) => {
            return Err(CliError::Command(format!(
                "unknown section: {other} (expected: {})",
                SECTIONS.join(", ")
            )));
        }
    };

    Ok(ConfigReport {
        source,
        section: section.map(str::to_owned),
        config: value,
        config_toml: toml_text,
    })
}

fn to_toml<T: Serialize>(value: &T) -> String {
    toml::to_string_pretty(value).unwrap_or_else(|e| format!("(serialization error: {e})"))
}

#[derive(Serialize)]
pub struct ConfigReport {
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub config: serde_json::Value,
    /// Text rendering only
    #[serde(skip)]
    pub config_toml: String,
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        match &self.section {
            Some(section) => writeln!(
                w,
                "Configuration {} (source: {})",
                format!("[{section}]").bold(),
                self.source
            )?,
            None => writeln!(w, "Configuration (source: {})", self.source.bold())?,
        }
        writeln!(w)?;
        write!(w, "{}", self.config_toml)
    }
}

#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(w, "Config Validation: {}", self.source.bold())?;
        if self.valid {
            writeln!(w, "  Result: {}", "VALID".green().bold())?;
        } else {
            writeln!(w, "  Result: {}", "INVALID".red().bold())?;
            for err in &self.errors {
                writeln!(w, "  Error: {}", err.red())?;
            }
        }
        Ok(())
    }
}
