//! Atomic publishing of the knowledge file.

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use chatkb_shared::{ChatKbError, KnowledgeBase, Result};

fn temp_path(target: &Path) -> Result<PathBuf> {
    let name = target
        .file_name()
        .ok_or_else(|| ChatKbError::validation(format!("output path '{}' has no file name", target.display())))?;
    Ok(target.with_file_name(format!(".{}.tmp", name.to_string_lossy())))
}

/// Write `kb` to `path` as pretty JSON, replacing any previous file in one
/// rename. On failure the previous file is untouched.
#[instrument(skip_all, fields(path = %path.display(), items = kb.total()))]
pub fn publish(path: &Path, kb: &KnowledgeBase) -> Result<()> {
    let temp = temp_path(path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ChatKbError::write(parent, e))?;
    }

    let json = serde_json::to_string_pretty(kb)
        .map_err(|e| ChatKbError::validation(format!("failed to serialize knowledge base: {e}")))?;

    if let Err(e) = std::fs::write(&temp, format!("{json}\n")) {
        discard(&temp);
        return Err(ChatKbError::write(&temp, e));
    }

    if let Err(e) = std::fs::rename(&temp, path) {
        discard(&temp);
        return Err(ChatKbError::write(path, e));
    }

    debug!(bytes = json.len(), "knowledge file published");
    Ok(())
}

fn discard(temp: &Path) {
    if temp.is_file() {
        let _ = std::fs::remove_file(temp);
    }
}

/// Read and validate a published knowledge file.
pub fn load_published(path: &Path) -> Result<KnowledgeBase> {
    let raw = std::fs::read_to_string(path).map_err(|e| ChatKbError::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| {
        ChatKbError::validation(format!("{} is not a valid knowledge file: {e}", path.display()))
    })
}
