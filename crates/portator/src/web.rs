use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::net::TcpListener;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

const INDEX_FILE: &str = "index.html";

/// Parse a user-supplied port; anything outside 1..=65535 is rejected.
pub fn parse_port(raw: &str) -> Option<u16> {
    match raw.trim().parse::<u32>() {
        Ok(port) if (1..=u32::from(u16::MAX)).contains(&port) => u16::try_from(port).ok(),
        _ => None,
    }
}

pub fn router(wwwroot: &Path) -> axum::Router {
    axum::Router::new()
        .fallback_service(
            ServeDir::new(wwwroot).fallback(ServeFile::new(wwwroot.join(INDEX_FILE))),
        )
        .layer(TraceLayer::new_for_http())
}

/// Serve `wwwroot` on localhost until a line arrives on stdin.
pub fn serve(wwwroot: PathBuf, port: u16) -> Result<()> {
    if !wwwroot.is_dir() {
        anyhow::bail!("web root not found: {}", wwwroot.display());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        tracing::info!(%addr, root = %wwwroot.display(), "web UI listening");
        println!("Web UI at http://localhost:{port}/");
        println!("Press Enter to stop the server...");

        axum::serve(listener, router(&wwwroot))
            .with_graceful_shutdown(wait_for_enter())
            .await
            .context("serve web UI")
    })
}

async fn wait_for_enter() {
    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    if let Err(err) = stdin.read_line(&mut line).await {
        tracing::debug!("stdin: {err}");
    }
}
