use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use atrium_toolchain::PackageManager;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::Mutex,
};

const INTERRUPT_GRACE: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Inner {
    current_child: Option<Child>,
    output: String,
}

/// Owns the single dev-server child of one project and runs the project's
/// blocking toolchain commands (lint, type check, install, add).
///
/// Mutating operations serialize on one lock. The stdout/stderr pumps take
/// the same lock once per line so a slow reader never blocks the child.
#[derive(Debug, Clone)]
pub struct Supervisor {
    project_path: PathBuf,
    package_manager: PackageManager,
    inner: Arc<Mutex<Inner>>,
}

/// The child is its own session leader (setsid below), so the negative pid
/// reaches the whole dev-server tree.
#[cfg(unix)]
fn signal_process_group(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

impl Supervisor {
    pub fn new(project_path: impl Into<PathBuf>, package_manager: PackageManager) -> Self {
        Self {
            project_path: project_path.into(),
            package_manager,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn exists(&self) -> bool {
        self.project_path.exists()
    }

    /// Spawn `<pm> run dev --port <port>` with the project directory as cwd
    /// and the runner's environment. Returns once the child is launched;
    /// readiness is the orchestrator's concern, not ours.
    pub async fn start_dev_server(&self, port: u16) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.current_child.is_some() {
            anyhow::bail!("dev server already running for {}", self.project_path.display());
        }

        let mut cmd = Command::new(self.package_manager.as_str());
        cmd.args(["run", "dev", "--port", &port.to_string()])
            .current_dir(&self.project_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("start dev server in {}", self.project_path.display()))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_output_pump(stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_output_pump(stderr);
        }

        tracing::info!(
            project = %self.project_path.display(),
            port,
            pid = child.id(),
            "dev server spawned"
        );
        inner.current_child = Some(child);
        Ok(())
    }

    fn spawn_output_pump(&self, pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let mut inner = inner.lock().await;
                inner.output.push_str(&line);
                inner.output.push('\n');
            }
        });
    }

    /// Interrupt the child, escalating to SIGKILL when it ignores us.
    /// Returns true iff a process existed and is now gone. The child slot and
    /// the output buffer are cleared either way.
    pub async fn stop_current_process(&self) -> bool {
        let child = self.inner.lock().await.current_child.take();

        let Some(mut child) = child else {
            self.inner.lock().await.output.clear();
            return false;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            signal_process_group(pid, libc::SIGINT);
        }

        let stopped = match tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(%status, "dev server exited after interrupt");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed waiting for dev server exit");
                true
            }
            Err(_) => {
                tracing::warn!("dev server ignored interrupt, killing forcefully");
                #[cfg(unix)]
                if let Some(pid) = child.id() {
                    signal_process_group(pid, libc::SIGKILL);
                }
                let _ = child.start_kill();
                match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(_) => true,
                    Err(_) => {
                        tracing::error!("dev server kill timed out");
                        false
                    }
                }
            }
        };

        // Clear only once the child is gone so the pumps' last lines go too.
        self.inner.lock().await.output.clear();
        stopped
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.current_child.is_some()
    }

    pub async fn get_last_output(&self) -> String {
        self.inner.lock().await.output.clone()
    }

    pub async fn clear_output(&self) {
        self.inner.lock().await.output.clear();
    }

    /// `<pm> run lint`, success = exit 0, output = combined stdout+stderr.
    pub async fn run_lint(&self) -> (bool, String) {
        self.run_tool_argv(&["run", "lint"]).await
    }

    /// Runs the incremental type check instead of a full build; this is the
    /// hot-path compile check. Goes through `sh -c` so the command string's
    /// `--` passthrough expands the way the toolchain expects.
    pub async fn check_build_errors(&self) -> (bool, String) {
        let cmd = self.package_manager.type_check_cmd();
        let out = Command::new("sh")
            .args(["-c", cmd])
            .current_dir(&self.project_path)
            .output()
            .await;
        Self::finish_tool(out)
    }

    /// `<pm> add <name>`.
    pub async fn add_package(&self, package_name: &str) -> (bool, String) {
        if !self.exists() {
            return (
                false,
                format!("project directory does not exist: {}", self.project_path.display()),
            );
        }
        self.run_tool_argv(&["add", package_name]).await
    }

    /// `<pm> install`; the error carries the combined output so callers can
    /// surface it verbatim.
    pub async fn install_dependencies(&self) -> anyhow::Result<()> {
        if !self.exists() {
            anyhow::bail!("project directory does not exist: {}", self.project_path.display());
        }

        let (success, output) = self.run_tool_argv(&["install"]).await;
        if !success {
            anyhow::bail!("failed to install dependencies:\n{output}");
        }
        Ok(())
    }

    async fn run_tool_argv(&self, args: &[&str]) -> (bool, String) {
        let out = Command::new(self.package_manager.as_str())
            .args(args)
            .current_dir(&self.project_path)
            .output()
            .await;
        Self::finish_tool(out)
    }

    fn finish_tool(out: std::io::Result<std::process::Output>) -> (bool, String) {
        match out {
            Ok(out) => {
                let mut combined = String::from_utf8_lossy(&out.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&out.stderr));
                (out.status.success(), combined)
            }
            Err(e) => (false, format!("failed to run command: {e}")),
        }
    }
}
