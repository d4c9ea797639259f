//! Project auto-discovery.
//!
//! Scans the configured roots one level deep for directories carrying a
//! marker file (`CLAUDE.md`, `.git`, `AGENTS.md` by default), skipping
//! the exclusion list. The synthetic `home` project is always present.

use std::path::{Path, PathBuf};

use tracing::info;

use intercom_types::wire::ProjectManifest;
use intercom_types::DiscoveryConfig;

/// Discover projects under the configured scan paths.
pub fn discover_projects(config: &DiscoveryConfig) -> Vec<ProjectManifest> {
    let mut projects = vec![ProjectManifest {
        id: "home".into(),
        description: "General agent for this machine".into(),
        capabilities: Vec::new(),
        path: String::new(),
    }];

    if !config.enabled {
        return projects;
    }

    for root in &config.scan_paths {
        let Ok(entries) = std::fs::read_dir(root) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || config.exclude.iter().any(|e| e == name) {
                continue;
            }
            if has_marker(&path, &config.detect_by) {
                projects.push(ProjectManifest {
                    id: name.to_string(),
                    description: String::new(),
                    capabilities: Vec::new(),
                    path: path.display().to_string(),
                });
            }
        }
    }

    projects.sort_by(|a, b| a.id.cmp(&b.id));
    projects.dedup_by(|a, b| a.id == b.id);
    info!(count = projects.len(), "projects discovered");
    projects
}

fn has_marker(dir: &Path, markers: &[String]) -> bool {
    markers.iter().any(|marker| dir.join(marker).exists())
}

/// Which project a working directory belongs to, walking up from `cwd`
/// through the discovered project paths. Falls back to `home`.
pub fn detect_current_project(projects: &[ProjectManifest], cwd: &Path) -> String {
    let mut by_path: Vec<(PathBuf, &str)> = projects
        .iter()
        .filter(|p| !p.path.is_empty())
        .map(|p| (PathBuf::from(&p.path), p.id.as_str()))
        .collect();
    by_path.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));

    let mut current = Some(cwd);
    while let Some(dir) = current {
        for (path, id) in &by_path {
            if dir == path {
                return (*id).to_string();
            }
        }
        current = dir.parent();
    }
    "home".into()
}
