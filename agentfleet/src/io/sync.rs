//! Put the profile's code tree on the host as an exact mirror.

use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::core::profile::RemoteLayout;
use crate::error::DeployError;
use crate::io::remote::{MirrorRequest, Remote, home_path, shell_quote};

/// Operator-side secret material that never leaves the machine through sync,
/// whatever the configured excludes say.
pub const PROTECTED_PATHS: [&str; 2] = ["secrets/", "/config/deploy_credentials.toml"];

/// Where the code comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSource {
    /// Operator's working tree, pushed with rsync.
    LocalTree(PathBuf),
    /// Checked out on the host itself.
    Git { url: String, branch: String },
}

/// Mirror the source into the profile's install root.
///
/// Re-running with an unchanged source changes nothing remotely. Excluded
/// paths are neither copied nor deleted.
#[instrument(skip_all, fields(destination = %remote.destination(), profile = %layout.profile))]
pub fn sync_tree<R: Remote>(
    remote: &R,
    source: &SyncSource,
    layout: &RemoteLayout,
    excludes: &[String],
) -> Result<(), DeployError> {
    match source {
        SyncSource::LocalTree(root) => {
            if !root.is_dir() {
                return Err(DeployError::Sync(format!(
                    "local source tree {} does not exist",
                    root.display()
                )));
            }
            let request = mirror_request(root, layout, excludes);
            remote
                .mirror(&request)
                .and_then(|out| out.check("rsync"))
                .map_err(DeployError::sync)?;
            info!(source = %root.display(), "tree mirrored");
        }
        SyncSource::Git { url, branch } => {
            let script = git_checkout_script(&layout.install_root, url, branch);
            remote
                .exec(&script)
                .and_then(|out| out.check("git checkout"))
                .map_err(|err| DeployError::sync(err.context(format!("{url}@{branch}"))))?;
            info!(%url, %branch, "checkout updated");
        }
    }
    Ok(())
}

/// Protected paths first, then `excludes`. Every entry is also kept safe from
/// `--delete` on the host.
pub fn mirror_request(root: &Path, layout: &RemoteLayout, excludes: &[String]) -> MirrorRequest {
    let mut all: Vec<String> = PROTECTED_PATHS.iter().map(|p| p.to_string()).collect();
    for pattern in excludes {
        if !all.contains(pattern) {
            all.push(pattern.clone());
        }
    }
    MirrorRequest {
        local_root: root.to_path_buf(),
        remote_dir: layout.install_root.clone(),
        excludes: all,
    }
}

/// Clone-or-update script; leaves the work tree identical to `origin/<branch>`
/// apart from the virtualenv.
pub fn git_checkout_script(install_root: &str, url: &str, branch: &str) -> String {
    format!(
        "command -v git >/dev/null 2>&1 || {{ echo 'git is not installed' >&2; exit 127; }}\n\
         set -e\n\
         mkdir -p {dir}\n\
         cd {dir}\n\
         [ -d .git ] || git init -q\n\
         git fetch -q --prune {url} {branch}\n\
         git reset -q --hard FETCH_HEAD\n\
         git clean -q -fdx -e .venv\n",
        dir = home_path(install_root),
        url = shell_quote(url),
        branch = shell_quote(branch),
    )
}
