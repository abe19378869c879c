use strata_integrations::{
    BackendView, ConflictView, EntryKind, FileView, FilterView, SyncConfigView, SyncStatusView,
    TagView, VfsEntry,
};

const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];

pub fn human_size(bytes: i64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn kind_marker(kind: EntryKind) -> &'static str {
    match kind {
        EntryKind::Backend => "backend",
        EntryKind::Filter => "filter",
        EntryKind::Directory => "dir",
        EntryKind::File => "file",
    }
}

pub fn entry_lines(entries: &[VfsEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|entry| {
            let size = entry.size.map(human_size).unwrap_or_default();
            let name = match entry.kind {
                EntryKind::Directory | EntryKind::Backend => format!("{}/", entry.name),
                _ => entry.name.clone(),
            };
            format!("{:<8} {:>10}  {name}", kind_marker(entry.kind), size)
        })
        .collect()
}

pub fn file_lines(files: &[FileView]) -> Vec<String> {
    files
        .iter()
        .map(|file| format!("{:>10}  {}", human_size(file.size), file.virtual_path()))
        .collect()
}

pub fn tag_lines(tags: &[TagView]) -> Vec<String> {
    tags.iter()
        .map(|tag| format!("{}={}", tag.key, tag.value))
        .collect()
}

pub fn backend_lines(backends: &[BackendView]) -> Vec<String> {
    backends
        .iter()
        .map(|backend| {
            format!(
                "{}  {}  {}/{}  files={} size={}",
                backend.id,
                backend.name,
                backend.endpoint,
                backend.bucket,
                backend.file_count,
                human_size(backend.total_bytes)
            )
        })
        .collect()
}

pub fn filter_lines(filters: &[FilterView]) -> Vec<String> {
    filters
        .iter()
        .map(|filter| format!("{}  {}", filter.virtual_path, filter.query))
        .collect()
}

pub fn sync_lines(configs: &[SyncConfigView]) -> Vec<String> {
    configs
        .iter()
        .map(|config| {
            let state = if config.enabled { "enabled" } else { "paused" };
            format!(
                "{}  {} -> {}  {}  {state}",
                config.name, config.source, config.destination, config.direction
            )
        })
        .collect()
}

pub fn status_lines(status: &SyncStatusView) -> Vec<String> {
    let mut lines = vec![format!(
        "configs={} enabled={} running={} errored={}",
        status.configs, status.enabled, status.running, status.errored
    )];
    for state in &status.states {
        let mut line = format!(
            "  {} [{}] {} synced={} bytes={}",
            state.config,
            state.backend_id,
            state.phase,
            state.files_synced,
            human_size(state.bytes_synced)
        );
        if let Some(error) = &state.last_error {
            line.push_str(&format!(" error={error}"));
        }
        lines.push(line);
    }
    lines
}

pub fn conflict_lines(conflicts: &[ConflictView]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {}  winner={}  {}",
                conflict.config, conflict.path, conflict.winner, conflict.reason
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_use_binary_units() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn entries_mark_containers_with_a_slash() {
        let entries = vec![
            VfsEntry {
                name: "docs".into(),
                path: "selfhosted/docs".into(),
                kind: EntryKind::Directory,
                size: None,
                modified_at: None,
            },
            VfsEntry {
                name: "pic.jpg".into(),
                path: "selfhosted/pic.jpg".into(),
                kind: EntryKind::File,
                size: Some(2048),
                modified_at: Some(0),
            },
        ];
        let lines = entry_lines(&entries);
        assert!(lines[0].starts_with("dir"));
        assert!(lines[0].ends_with("docs/"));
        assert!(lines[1].contains("2.0 KiB"));
        assert!(lines[1].ends_with("pic.jpg"));
    }

    #[test]
    fn status_includes_failing_states() {
        let status = SyncStatusView {
            configs: 1,
            enabled: 1,
            running: 0,
            errored: 1,
            states: vec![strata_integrations::SyncStateView {
                config: "docs".into(),
                backend_id: "selfhosted".into(),
                client_id: "laptop".into(),
                phase: "error".into(),
                last_sync_at: None,
                cursor: None,
                files_scanned: 0,
                files_synced: 0,
                bytes_synced: 0,
                error_count: 3,
                last_error: Some("backend unreachable".into()),
            }],
        };
        let lines = status_lines(&status);
        assert_eq!(lines[0], "configs=1 enabled=1 running=0 errored=1");
        assert!(lines[1].contains("error=backend unreachable"));
    }
}
