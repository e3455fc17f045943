//! Persistent device identity and cluster join parameters.
//!
//! The agent keeps two files under its state directory: `id`, the device
//! identifier the registrar assigned (re-sent on every boot so registration
//! stays idempotent), and `join.env`, the environment file the cluster agent
//! service reads its join credentials from.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

const ID_FILE: &str = "id";
const JOIN_ENV_FILE: &str = "join.env";

/// Read the persisted device id, if this device has one.
pub async fn load_id(state_dir: &Path) -> std::io::Result<Option<String>> {
    match fs::read_to_string(state_dir.join(ID_FILE)).await {
        Ok(raw) => {
            let id = raw.trim().to_string();
            Ok((!id.is_empty()).then_some(id))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist the id the server handed back, so later boots re-register as the
/// same device.
pub async fn save_id(state_dir: &Path, id: &str) -> std::io::Result<()> {
    fs::create_dir_all(state_dir).await?;
    fs::write(state_dir.join(ID_FILE), id).await
}

/// Write the environment file the cluster agent starts from, returning its
/// path. `CLUSTER_URL` is only written when one was configured.
pub async fn write_join_env(
    state_dir: &Path,
    cluster_url: Option<&str>,
    token: &str,
) -> std::io::Result<PathBuf> {
    let mut contents = String::new();
    if let Some(url) = cluster_url {
        contents.push_str(&format!("CLUSTER_URL={url}\n"));
    }
    contents.push_str(&format!("CLUSTER_TOKEN={token}\n"));

    fs::create_dir_all(state_dir).await?;
    let path = state_dir.join(JOIN_ENV_FILE);
    fs::write(&path, contents).await?;

    // The join token must not be world readable.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    debug!(path = %path.display(), "wrote join environment");
    Ok(path)
}
