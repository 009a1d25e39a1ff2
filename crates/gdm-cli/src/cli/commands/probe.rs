//! `gdm probe` – ask the server for a resource's size.

use anyhow::{Context, Result};
use gdm_core::config::GdmConfig;
use gdm_core::transport::{CurlOptions, CurlTransport, Transport};

pub async fn run_probe(cfg: &GdmConfig, url: &str) -> Result<()> {
    let transport = CurlTransport::new(CurlOptions::from_config(cfg));
    let headers = cfg.headers.clone();
    let target = url.to_string();
    let len = tokio::task::spawn_blocking(move || transport.content_length(&target, &headers))
        .await
        .context("probe task panicked")?
        .with_context(|| format!("probing {url}"))?;
    match len {
        Some(0) => println!("{url}: empty (0 bytes)"),
        Some(n) => println!("{url}: {n} bytes ({:.2} MiB)", n as f64 / 1_048_576.0),
        None => println!("{url}: size unknown"),
    }
    Ok(())
}
