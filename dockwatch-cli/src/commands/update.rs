//! `dockwatch update`

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use dockwatch_watcher::{ContainerMutator, Updater, WatcherError};

use crate::cli::UpdateArgs;
use crate::commands::{connect_docker, load_config};
use crate::error::CliError;
use crate::output::{OutputWriter, Render, short_id};

pub async fn execute(args: UpdateArgs, config_path: &Path, writer: &OutputWriter) -> Result<(), CliError> {
    let config = load_config(config_path).await?;
    let docker = Arc::new(connect_docker(&config)?);

    let details = docker.inspect_container(&args.container).await?;
    let image = match args.image {
        Some(image) if !image.trim().is_empty() => image,
        _ => details.spec.image().to_owned(),
    };
    if image.is_empty() {
        return Err(CliError::Command(format!(
            "container {} has no image reference, pass --image",
            details.name
        )));
    }

    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(config.scan.update_timeout_secs).max(1));
    info!(container = %details.name, image = %image, timeout_secs = timeout.as_secs(), "updating container");

    let started = Instant::now();
    let updater = Updater::new(docker);
    let cancel = CancellationToken::new();
    let update = updater.update_container(&cancel, &details.id, &image);
    tokio::pin!(update);
    tokio::select! {
        result = &mut update => result?,
        _ = tokio::time::sleep(timeout) => {
            // let the updater put the container back before reporting
            cancel.cancel();
            match update.await {
                Err(WatcherError::Cancelled) => {
                    return Err(CliError::Update {
                        stage: None,
                        message: format!("timed out after {}s", timeout.as_secs()),
                    });
                }
                other => other?,
            }
        }
    }

    writer.render(&UpdateReport {
        container_id: details.id.clone(),
        name: details.name,
        image: image.clone(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

#[derive(Debug, Serialize)]
pub struct UpdateReport {
    /// Id of the replaced container
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub elapsed_ms: u64,
}

impl Render for UpdateReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        use colored::Colorize;

        writeln!(
            w,
            "{} {} ({}) recreated on {} in {:.1}s",
            "✓".green().bold(),
            self.name.bold(),
            short_id(&self.container_id),
            self.image,
            self.elapsed_ms as f64 / 1000.0
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_names_container_and_image() {
        colored::control::set_override(false);
        let report = UpdateReport {
            container_id: "0123456789abcdef".to_owned(),
            name: "web".to_owned(),
            image: "nginx:1.27".to_owned(),
            elapsed_ms: 2500,
        };
        let mut buf = Vec::new();
        report.render_text(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "✓ web (0123456789ab) recreated on nginx:1.27 in 2.5s\n");
    }
}
