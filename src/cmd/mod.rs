use anyhow::{Context, Result};
use indicatif::HumanBytes;
use std::sync::Arc;

use edge_gallery::catalog::{JsonCatalog, ModelDescriptor, Resolver};
use edge_gallery::download::{
    self, DownloadOrchestrator, DownloadRequest, DownloadState, HttpExecutor,
};
use edge_gallery::events::Events;
use edge_gallery::progress::DownloadBar;
use edge_gallery::EnvConfig;

fn resolver(config: &EnvConfig) -> Resolver {
    Resolver::new(Arc::new(JsonCatalog::new(&config.catalog_path)))
        .vendor_prefix(config.vendor_prefix.clone())
}

fn describe(config: &EnvConfig, model: &str) -> Result<ModelDescriptor> {
    resolver(config)
        .resolve(model)
        .with_context(|| format!("looking up {} in {:?}", model, config.catalog_path))
}

pub async fn list() -> Result<i32> {
    let config = EnvConfig::from_env();
    let models = resolver(&config).list()?;

    println!("\n{:<48} {:<10} {:<10} PRESENT", "NAME", "VERSION", "SIZE");
    println!("{}", "-".repeat(80));

    for m in models {
        let present = if download::is_present(&config.models_dir, &m) { "yes" } else { "-" };
        println!(
            "{:<48} {:<10} {:<10} {}",
            m.id,
            m.version,
            HumanBytes(m.expected_size).to_string(),
            present
        );
    }

    Ok(0)
}

pub async fn path(model: &str) -> Result<i32> {
    let config = EnvConfig::from_env();
    let descriptor = describe(&config, model)?;
    println!("{}", descriptor.local_path(&config.models_dir).display());
    Ok(0)
}

pub async fn check(model: &str) -> Result<i32> {
    let config = EnvConfig::from_env();
    let descriptor = describe(&config, model)?;

    if download::is_present(&config.models_dir, &descriptor) {
        println!("{} is downloaded", model);
        Ok(0)
    } else {
        println!("{} is not downloaded", model);
        Ok(1)
    }
}

pub async fn pull(model: &str, url: Option<String>, token: Option<String>) -> Result<i32> {
    let config = EnvConfig::from_env();
    let descriptor = describe(&config, model)?;
    let url = url.unwrap_or_else(|| descriptor.default_source_url(&config.download_base));

    let events = Events::new(config.event_buffer);
    let mut progress = events.progress.subscribe();
    let orchestrator = DownloadOrchestrator::new(
        &config.models_dir,
        Arc::new(HttpExecutor::new()?),
        Arc::clone(&events),
    )
    .default_tag(config.download_tag.clone());

    let bar = DownloadBar::new(model, descriptor.expected_size);
    let handle = orchestrator.start(DownloadRequest::new(descriptor, url).auth_token(token))?;

    loop {
        tokio::select! {
            event = progress.recv() => {
                match event {
                    Some(event) if event.task_id == handle.id() => {
                        if bar.update(&event) {
                            break;
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel(handle.tag());
            }
        }
    }

    let task = handle.finish().await?;
    if task.state == DownloadState::Cancelled {
        eprintln!("download of {} cancelled", model);
        return Ok(1);
    }
    Ok(0)
}

pub async fn version() -> Result<i32> {
    println!("gallery version {}", env!("CARGO_PKG_VERSION"));
    Ok(0)
}
