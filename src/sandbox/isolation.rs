use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Operating-system confinement requested for the interpreter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Bubblewrap if it works on this host, else a user and network
    /// namespace, else none (logged as a warning).
    #[default]
    Auto,
    /// Read-only root filesystem with only the output and scratch
    /// directories writable, no network, private pid namespace.
    Bubblewrap,
    /// `unshare -rn`: private user and network namespace.
    Namespace,
    /// Harness guards only.
    None,
}

/// Confinement actually applied to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confinement {
    Bubblewrap,
    Namespace,
    Unconfined,
}

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds interpreter commands wrapped in the configured confinement.
pub struct Isolator {
    mode: Isolation,
    bwrap: PathBuf,
    unshare: PathBuf,
    resolved: OnceCell<Confinement>,
}

impl Isolator {
    pub fn new(mode: Isolation, bwrap: PathBuf, unshare: PathBuf) -> Self {
        Self {
            mode,
            bwrap,
            unshare,
            resolved: OnceCell::new(),
        }
    }

    /// Resolve the confinement once. Explicit modes are never downgraded:
    /// if the wrapper is missing the launch fails instead.
    pub async fn confinement(&self) -> Confinement {
        *self.resolved.get_or_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Confinement {
        match self.mode {
            Isolation::Bubblewrap => Confinement::Bubblewrap,
            Isolation::Namespace => Confinement::Namespace,
            Isolation::None => Confinement::Unconfined,
            Isolation::Auto => {
                let scratch = std::env::temp_dir();
                for candidate in [Confinement::Bubblewrap, Confinement::Namespace] {
                    let check = self.command(candidate, Path::new("true"), &[scratch.as_path()]);
                    if works(check).await {
                        tracing::info!(confinement = ?candidate, "Sandbox isolation selected");
                        return candidate;
                    }
                }
                tracing::warn!(
                    "Neither bubblewrap nor user namespaces are usable; \
                     sandbox relies on interpreter guards only"
                );
                Confinement::Unconfined
            }
        }
    }

    /// Command running `program` under `confinement`. Arguments for the
    /// program are appended by the caller. `writable` directories stay
    /// writable under bubblewrap; everything else is read-only.
    pub fn command(&self, confinement: Confinement, program: &Path, writable: &[&Path]) -> Command {
        match confinement {
            Confinement::Unconfined => Command::new(program),
            Confinement::Namespace => {
                let mut command = Command::new(&self.unshare);
                command.args(["--user", "--map-root-user", "--net", "--"]);
                command.arg(program);
                command
            }
            Confinement::Bubblewrap => {
                let mut command = Command::new(&self.bwrap);
                command.args([
                    "--ro-bind",
                    "/",
                    "/",
                    "--dev",
                    "/dev",
                    "--proc",
                    "/proc",
                    "--unshare-net",
                    "--unshare-pid",
                    "--unshare-ipc",
                    "--die-with-parent",
                    "--new-session",
                ]);
                for dir in writable {
                    command.arg("--bind").arg(dir).arg(dir);
                }
                command.arg("--").arg(program);
                command
            }
        }
    }
}

async fn works(mut command: Command) -> bool {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let Ok(mut child) = command.spawn() else {
        return false;
    };
    matches!(
        tokio::time::timeout(CHECK_TIMEOUT, child.wait()).await,
        Ok(Ok(status)) if status.success()
    )
}
