use tempfile::TempDir;

use crate::{Role, SessionConfig};


pub(crate) fn session_config(
    dir: &TempDir,
    prefix: &str,
    create: bool,
    role: Role,
    timeout_secs: f64,
) -> SessionConfig {
    SessionConfig::new(prefix, 100, create, role, timeout_secs).data_dir(dir.path())
}
