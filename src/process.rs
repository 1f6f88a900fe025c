//! Process-liveness collaborator: which applications are currently running
//! from under the sync target directory. The update loop refuses to touch
//! files while any of them are alive.

use std::path::Path;

use sysinfo::{ProcessRefreshKind, RefreshKind, System, UpdateKind};

/// Names of running processes whose executable lives under `target_dir`,
/// sorted and deduplicated so repeated polls compare cheaply.
pub fn running_process_names(target_dir: &Path) -> Vec<String> {
    // Symlinked target directories must compare against the same form the
    // kernel reports for the executable path.
    let canonical = target_dir
        .canonicalize()
        .unwrap_or_else(|_| target_dir.to_path_buf());

    let refresh = RefreshKind::new()
        .with_processes(ProcessRefreshKind::new().with_exe(UpdateKind::Always));
    let system = System::new_with_specifics(refresh);

    let mut names: Vec<String> = system
        .processes()
        .values()
        .filter(|process| {
            process
                .exe()
                .is_some_and(|exe| exe.starts_with(&canonical))
        })
        .map(|process| process.name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn an_empty_directory_has_no_running_processes() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(running_process_names(tmp.path()).is_empty());
    }
}
