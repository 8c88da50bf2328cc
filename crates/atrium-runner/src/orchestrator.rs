use std::{path::PathBuf, sync::Arc, time::Duration};

use atrium_toolchain::PackageManager;
use tokio::sync::Mutex;

use crate::proxy::ProxyServer;
use crate::supervisor::Supervisor;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_PROBE_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct OrchestratorState {
    proxy: Option<Arc<ProxyServer>>,
    restarting: bool,
    upstream_port: u16,
}

/// Per-project coordinator: the only code that sequences the supervisor and
/// the proxy. Owns both exclusively; background tasks receive the handles
/// they need by value.
pub struct Orchestrator {
    project_path: PathBuf,
    supervisor: Supervisor,
    state: Mutex<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(project_path: impl Into<PathBuf>, package_manager: PackageManager) -> Self {
        let project_path = project_path.into();
        Self {
            supervisor: Supervisor::new(&project_path, package_manager),
            project_path,
            state: Mutex::new(OrchestratorState::default()),
        }
    }

    /// Flip the restarting flag on. Returns false when a restart is already
    /// in flight, in which case the caller should wait for that one instead.
    async fn try_begin_restart(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.restarting {
            return false;
        }
        state.restarting = true;
        true
    }

    async fn end_restart(&self) {
        self.state.lock().await.restarting = false;
    }

    /// Tear down whatever is running, then bring the project up behind the
    /// proxy: install deps on first run, start the proxy in loading mode,
    /// start the dev server, probe until it answers, flip the proxy live.
    ///
    /// Self-exclusive: a concurrent caller folds into waiting for the active
    /// restart's readiness outcome.
    pub async fn restart_project(&self, public_port: u16, upstream_port: u16) -> anyhow::Result<()> {
        if !self.try_begin_restart().await {
            let port = self.state.lock().await.upstream_port;
            return wait_for_app_ready(port, STARTUP_TIMEOUT).await;
        }

        let result = self.do_restart(public_port, upstream_port).await;
        self.end_restart().await;
        result
    }

    async fn do_restart(&self, public_port: u16, upstream_port: u16) -> anyhow::Result<()> {
        self.stop_project().await;

        self.state.lock().await.upstream_port = upstream_port;

        // First-run bootstrapping only; never redundantly reinstall.
        if !self.project_path.join("node_modules").exists() {
            tracing::info!(project = %self.project_path.display(), "node_modules missing, installing dependencies");
            self.supervisor.install_dependencies().await?;
        }

        let proxy = ProxyServer::new(public_port, upstream_port);
        proxy.set_loading(true);
        proxy.spawn();
        self.state.lock().await.proxy = Some(proxy.clone());

        self.supervisor.clear_output().await;
        if let Err(e) = self.supervisor.start_dev_server(upstream_port).await {
            proxy.stop().await;
            self.state.lock().await.proxy = None;
            return Err(e.context("failed to start development server"));
        }

        if let Err(e) = wait_for_app_ready(upstream_port, STARTUP_TIMEOUT).await {
            let captured = self.supervisor.get_last_output().await;
            proxy.stop().await;
            self.supervisor.stop_current_process().await;
            self.state.lock().await.proxy = None;
            return Err(e.context(format!("app failed to start:\n{captured}")));
        }

        proxy.set_loading(false);
        tracing::info!(
            project = %self.project_path.display(),
            public_port,
            upstream_port,
            "project is live"
        );
        Ok(())
    }

    /// Stop the proxy and the dev server, bounded by a hard deadline. The
    /// proxy handle is snapshotted and nulled up front so this never acts on
    /// a proxy created after the stop was issued. Returns false on timeout
    /// or when the stop task itself dies.
    pub async fn stop_project(&self) -> bool {
        let mut state = self.state.lock().await;
        let proxy = state.proxy.take();

        let task = tokio::spawn({
            let proxy = proxy.clone();
            let supervisor = self.supervisor.clone();
            async move {
                if let Some(proxy) = &proxy {
                    proxy.stop().await;
                }
                supervisor.stop_current_process().await
            }
        });

        match tokio::time::timeout(STOP_TIMEOUT, task).await {
            Ok(Ok(success)) => success,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "stop task failed");
                false
            }
            Err(_) => {
                tracing::warn!(
                    project = %self.project_path.display(),
                    "stop timed out, forcing proxy and dev server down"
                );
                if let Some(proxy) = &proxy {
                    proxy.stop().await;
                }
                self.supervisor.stop_current_process().await;
                false
            }
        }
    }

    /// Healthy means: a proxy exists, no restart is in flight, the child is
    /// alive, and the dev server answers a HEAD probe.
    pub async fn is_running(&self) -> bool {
        let upstream_port = {
            let state = self.state.lock().await;
            if state.proxy.is_none() || state.restarting {
                return false;
            }
            state.upstream_port
        };

        if !self.supervisor.is_running().await {
            return false;
        }

        let probe = async {
            let client = match reqwest::Client::builder().timeout(PROBE_REQUEST_TIMEOUT).build() {
                Ok(client) => client,
                Err(_) => return false,
            };
            client
                .head(format!("http://localhost:{upstream_port}/"))
                .send()
                .await
                .is_ok()
        };

        tokio::time::timeout(HEALTH_PROBE_DEADLINE, probe)
            .await
            .unwrap_or(false)
    }

    pub async fn run_lint(&self) -> (bool, String) {
        self.supervisor.run_lint().await
    }

    pub async fn check_build_errors(&self) -> (bool, String) {
        self.supervisor.check_build_errors().await
    }

    pub async fn add_package(&self, package_name: &str) -> (bool, String) {
        self.supervisor.add_package(package_name).await
    }
}

/// Poll `GET /` on the upstream until anything answers. The status code is
/// ignored because frameworks disagree about their root route.
async fn wait_for_app_ready(upstream_port: u16, timeout: Duration) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_REQUEST_TIMEOUT)
        .build()?;
    let url = format!("http://localhost:{upstream_port}/");
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timeout waiting for app to start on port {upstream_port}");
        }

        match client.get(&url).send().await {
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "app server not ready");
            }
        }

        tokio::time::sleep(READINESS_POLL_INTERVAL).await;
    }
}
