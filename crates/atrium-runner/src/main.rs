mod api;
mod file_service;
mod git_service;
mod injector;
mod orchestrator;
mod port_alloc;
mod proxy;
mod static_assets;
mod supervisor;

use std::path::PathBuf;

use anyhow::Context;
use atrium_toolchain::PackageManager;
use clap::{Parser, Subcommand};

use crate::orchestrator::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "atrium", about = "Workspace preview runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the development preview for a single project
    Preview {
        /// Project directory (defaults to the current directory)
        project_path: Option<PathBuf>,
        /// Package manager to use (npm|pnpm|yarn)
        #[arg(long, default_value = "pnpm")]
        package_manager: String,
        /// Public port the preview proxy listens on
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },
    /// Run the control plane server
    Control {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port the control plane listens on
        #[arg(long, default_value_t = 8088)]
        port: u16,
        /// Globally exclusive port the preview proxy listens on
        #[arg(long, default_value_t = 3000)]
        proxy_port: u16,
        /// Package manager to use (npm|pnpm|yarn)
        #[arg(long, default_value = "pnpm")]
        package_manager: String,
    },
}

/// ENV=production selects the production env file; everything else is
/// development.
fn env_file_name(env: &str) -> &'static str {
    if env == "production" {
        ".env.production"
    } else {
        ".env.development"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Preview { project_path, package_manager, port } => {
            preview(project_path, &package_manager, port).await
        }
        Command::Control { host, port, proxy_port, package_manager } => {
            control(&host, port, proxy_port, &package_manager).await
        }
    }
}

async fn preview(project_path: Option<PathBuf>, package_manager: &str, port: u16) -> anyhow::Result<()> {
    let package_manager: PackageManager = package_manager.parse()?;
    let project_path = project_path.unwrap_or_else(|| PathBuf::from("."));

    let app_port = port_alloc::find_free_port()?;
    let orchestrator = Orchestrator::new(project_path, package_manager);
    orchestrator
        .restart_project(port, app_port)
        .await
        .context("failed to start project")?;

    tracing::info!(port, "development server started");

    // Serve until signalled.
    std::future::pending::<()>().await;
    Ok(())
}

async fn control(host: &str, port: u16, proxy_port: u16, package_manager: &str) -> anyhow::Result<()> {
    let env = std::env::var("ENV").unwrap_or_default();
    let env_file = env_file_name(&env);
    if dotenvy::from_filename(env_file).is_err() {
        tracing::warn!(env_file, "env file not found, falling back to .env");
        if dotenvy::dotenv().is_err() {
            tracing::warn!(".env file not found");
        }
    }

    let package_manager: PackageManager = package_manager.parse()?;

    let workspace_path = std::env::var("WORKSPACE_PATH")
        .map_err(|_| anyhow::anyhow!("WORKSPACE_PATH environment variable must be set"))?;
    std::fs::create_dir_all(&workspace_path).context("failed to create workspace directory")?;

    let state = api::ControlPlane::new(proxy_port, package_manager, &workspace_path);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .with_context(|| format!("bind control plane on {host}:{port}"))?;

    tracing::info!(
        host,
        port,
        proxy_port,
        workspace = %workspace_path,
        "control plane listening"
    );
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_file_selection() {
        assert_eq!(env_file_name("production"), ".env.production");
        assert_eq!(env_file_name("development"), ".env.development");
        assert_eq!(env_file_name(""), ".env.development");
        assert_eq!(env_file_name("staging"), ".env.development");
    }

    #[test]
    fn cli_defaults_match_the_contract() {
        let cli = Cli::try_parse_from(["atrium", "preview"]).unwrap();
        match cli.command {
            Command::Preview { project_path, package_manager, port } => {
                assert!(project_path.is_none());
                assert_eq!(package_manager, "pnpm");
                assert_eq!(port, 3000);
            }
            _ => panic!("expected preview"),
        }

        let cli = Cli::try_parse_from(["atrium", "control", "--proxy-port", "4000"]).unwrap();
        match cli.command {
            Command::Control { host, port, proxy_port, package_manager } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 8088);
                assert_eq!(proxy_port, 4000);
                assert_eq!(package_manager, "pnpm");
            }
            _ => panic!("expected control"),
        }
    }
}
