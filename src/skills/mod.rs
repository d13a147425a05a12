//! Skill packages: installable prompt extensions.
//!
//! A skill is a directory with a `SKILL.md` manifest (title + description
//! + instructions) plus support files. Enabled skills contribute bounded
//! previews to every prompt.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SkillsConfig;
use crate::fsutil;

/// Error type for skill operations.
#[derive(Debug, Error)]
pub enum SkillError {
    #[error("skills are disabled")]
    Disabled,

    #[error("skill not found: {0}")]
    NotFound(String),

    #[error("invalid skill package: {0}")]
    InvalidPackage(String),

    #[error("install limits exceeded: {0}")]
    LimitExceeded(String),

    #[error(transparent)]
    Storage(#[from] fsutil::FsError),
}

/// Summary of one installed skill.
#[derive(Debug, Clone, Serialize)]
pub struct SkillInfo {
    pub id: String,
    pub title: String,
    pub description: String,
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SkillState {
    #[serde(default)]
    enabled: HashSet<String>,
}

/// Manages the skills directory and enablement state.
pub struct SkillManager {
    skills_dir: PathBuf,
    state_path: PathBuf,
    config: SkillsConfig,
    state: Mutex<SkillState>,
}

impl SkillManager {
    pub fn new(skills_dir: PathBuf, state_path: PathBuf, config: SkillsConfig) -> Self {
        let state: SkillState = fsutil::read_json_or_quarantine(&state_path).unwrap_or_default();
        Self {
            skills_dir,
            state_path,
            config,
            state: Mutex::new(state),
        }
    }

    fn persist(&self, state: &SkillState) -> Result<(), SkillError> {
        fsutil::write_json_atomic(&self.state_path, state)?;
        Ok(())
    }

    fn parse_manifest(content: &str) -> (String, String) {
        let title = content
            .lines()
            .find(|l| l.starts_with('#'))
            .map(|l| l.trim_start_matches('#').trim().to_string())
            .unwrap_or_default();
        let description = content
            .lines()
            .skip_while(|l| l.trim().is_empty() || l.starts_with('#'))
            .take_while(|l| !l.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (title, description)
    }

    fn read_info(&self, id: &str, enabled: &HashSet<String>) -> Option<SkillInfo> {
        let dir = self.skills_dir.join(id);
        let manifest = std::fs::read_to_string(dir.join("SKILL.md")).ok()?;
        let (title, description) = Self::parse_manifest(&manifest);
        Some(SkillInfo {
            id: id.to_string(),
            title,
            description,
            enabled: enabled.contains(id),
            path: dir,
        })
    }

    /// Installed skills, sorted by id, bounded by the catalog limit.
    pub fn list(&self) -> Vec<SkillInfo> {
        let enabled = self.state.lock().expect("skill state").enabled.clone();
        let mut ids: Vec<String> = std::fs::read_dir(&self.skills_dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.path().is_dir())
                    .filter_map(|e| e.file_name().to_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids.truncate(self.config.max_catalog_entries);
        ids.iter()
            .filter_map(|id| self.read_info(id, &enabled))
            .collect()
    }

    /// Install a skill package by copying a source directory into the
    /// skills tree. Enforces file-count and byte limits.
    pub fn install_from_dir(&self, source: &Path) -> Result<SkillInfo, SkillError> {
        if !self.config.enabled {
            return Err(SkillError::Disabled);
        }
        let id = source
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_ascii_lowercase().replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "-"))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SkillError::InvalidPackage("unnamed package".to_string()))?;

        let manifest_path = source.join("SKILL.md");
        let manifest_meta = std::fs::metadata(&manifest_path)
            .map_err(|_| SkillError::InvalidPackage("missing SKILL.md".to_string()))?;
        if manifest_meta.len() > self.config.max_skill_file_bytes {
            return Err(SkillError::LimitExceeded(format!(
                "SKILL.md is {} bytes (limit {})",
                manifest_meta.len(),
                self.config.max_skill_file_bytes
            )));
        }

        // Walk the package, counting files and bytes before copying.
        let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut total_bytes = 0u64;
        let mut stack = vec![source.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| SkillError::InvalidPackage(e.to_string()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                total_bytes += size;
                let relative = path
                    .strip_prefix(source)
                    .map_err(|e| SkillError::InvalidPackage(e.to_string()))?
                    .to_path_buf();
                files.push((path, relative));

                if files.len() > self.config.max_install_files {
                    return Err(SkillError::LimitExceeded(format!(
                        "more than {} files",
                        self.config.max_install_files
                    )));
                }
                if total_bytes > self.config.max_install_bytes {
                    return Err(SkillError::LimitExceeded(format!(
                        "more than {} bytes",
                        self.config.max_install_bytes
                    )));
                }
            }
        }

        let target = self.skills_dir.join(&id);
        fsutil::ensure_dir(&target)?;
        for (from, relative) in files {
            let to = target.join(&relative);
            if let Some(parent) = to.parent() {
                fsutil::ensure_dir(parent)?;
            }
            std::fs::copy(&from, &to)
                .map_err(|e| SkillError::InvalidPackage(format!("copy {}: {e}", relative.display())))?;
        }

        if self.config.auto_enable_on_install {
            self.enable(&id)?;
        }
        let enabled = self.state.lock().expect("skill state").enabled.clone();
        self.read_info(&id, &enabled)
            .ok_or_else(|| SkillError::InvalidPackage("manifest unreadable after copy".to_string()))
    }

    pub fn enable(&self, id: &str) -> Result<(), SkillError> {
        if !self.skills_dir.join(id).join("SKILL.md").exists() {
            return Err(SkillError::NotFound(id.to_string()));
        }
        let mut state = self.state.lock().expect("skill state");
        state.enabled.insert(id.to_string());
        self.persist(&state)
    }

    pub fn disable(&self, id: &str) -> Result<(), SkillError> {
        let mut state = self.state.lock().expect("skill state");
        if !state.enabled.remove(id) {
            return Err(SkillError::NotFound(id.to_string()));
        }
        self.persist(&state)
    }

    /// Full manifest text of a skill.
    pub fn show(&self, id: &str) -> Result<String, SkillError> {
        std::fs::read_to_string(self.skills_dir.join(id).join("SKILL.md"))
            .map_err(|_| SkillError::NotFound(id.to_string()))
    }

    /// Delete a skill from disk and state.
    pub fn remove(&self, id: &str) -> Result<(), SkillError> {
        let dir = self.skills_dir.join(id);
        if !dir.exists() {
            return Err(SkillError::NotFound(id.to_string()));
        }
        std::fs::remove_dir_all(&dir).map_err(|e| SkillError::InvalidPackage(e.to_string()))?;
        let mut state = self.state.lock().expect("skill state");
        state.enabled.remove(id);
        self.persist(&state)
    }

    /// Bounded previews of enabled skills for prompt injection.
    pub fn prompt_previews(&self) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }
        let mut previews = Vec::new();
        let mut budget = self.config.max_prompt_chars;
        for info in self.list().into_iter().filter(|s| s.enabled) {
            if previews.len() >= self.config.max_prompt_skills || budget == 0 {
                break;
            }
            let mut line = format!("{}: {}", info.title, info.description);
            if line.len() > budget {
                line.truncate(budget);
            }
            budget -= line.len();
            previews.push(line);
        }
        previews
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager_in(dir: &Path) -> SkillManager {
        let skills_dir = dir.join("skills");
        fsutil::ensure_dir(&skills_dir).unwrap();
        SkillManager::new(skills_dir, dir.join("skills.json"), SkillsConfig::default())
    }

    fn package(dir: &Path, name: &str, manifest: &str) -> PathBuf {
        let pkg = dir.join(name);
        std::fs::create_dir_all(&pkg).unwrap();
        std::fs::write(pkg.join("SKILL.md"), manifest).unwrap();
        pkg
    }

    #[test]
    fn test_install_and_list() {
        let dir = tempdir().unwrap();
        let manager = manager_in(dir.path());
        let pkg = package(
            dir.path(),
            "Weather",
            "# Weather\n\nFetch forecasts for any city.\n\n## Usage\n…",
        );

        let info = manager.install_from_dir(&pkg).unwrap();
        assert_eq!(info.id, "weather");
        assert_eq!(info.title, "Weather");
        assert!(info.enabled, "auto-enable on install");

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description, "Fetch forecasts for any city.");
    }

    #[test]
    fn test_install_rejects_missing_manifest() {
        let dir = tempdir().unwrap();
        let manager = manager_in(dir.path());
        let pkg = dir.path().join("empty-pkg");
        std::fs::create_dir_all(&pkg).unwrap();
        let err = manager.install_from_dir(&pkg).unwrap_err();
        assert!(matches!(err, SkillError::InvalidPackage(_)));
    }

    #[test]
    fn test_install_enforces_byte_limit() {
        let dir = tempdir().unwrap();
        let skills_dir = dir.path().join("skills");
        fsutil::ensure_dir(&skills_dir).unwrap();
        let manager = SkillManager::new(
            skills_dir,
            dir.path().join("skills.json"),
            SkillsConfig {
                max_install_bytes: 64,
                ..Default::default()
            },
        );
        let pkg = package(dir.path(), "big", "# Big\n\nshort\n");
        std::fs::write(pkg.join("data.bin"), vec![0u8; 1024]).unwrap();

        let err = manager.install_from_dir(&pkg).unwrap_err();
        assert!(matches!(err, SkillError::LimitExceeded(_)));
    }

    #[test]
    fn test_enable_disable_survive_reload() {
        let dir = tempdir().unwrap();
        let manager = manager_in(dir.path());
        let pkg = package(dir.path(), "notes", "# Notes\n\nKeep notes.\n");
        manager.install_from_dir(&pkg).unwrap();
        manager.disable("notes").unwrap();

        let reloaded = SkillManager::new(
            dir.path().join("skills"),
            dir.path().join("skills.json"),
            SkillsConfig::default(),
        );
        assert!(!reloaded.list()[0].enabled);
        reloaded.enable("notes").unwrap();
        assert!(reloaded.list()[0].enabled);
    }

    #[test]
    fn test_prompt_previews_bounded() {
        let dir = tempdir().unwrap();
        let skills_dir = dir.path().join("skills");
        fsutil::ensure_dir(&skills_dir).unwrap();
        let manager = SkillManager::new(
            skills_dir,
            dir.path().join("skills.json"),
            SkillsConfig {
                max_prompt_skills: 2,
                ..Default::default()
            },
        );
        for i in 0..4 {
            let pkg = package(dir.path(), &format!("skill-{i}"), &format!("# Skill {i}\n\nDoes thing {i}.\n"));
            manager.install_from_dir(&pkg).unwrap();
        }
        let previews = manager.prompt_previews();
        assert_eq!(previews.len(), 2);
        assert!(previews[0].starts_with("Skill 0"));
    }

    #[test]
    fn test_remove_deletes_dir() {
        let dir = tempdir().unwrap();
        let manager = manager_in(dir.path());
        let pkg = package(dir.path(), "gone", "# Gone\n\nBye.\n");
        manager.install_from_dir(&pkg).unwrap();

        manager.remove("gone").unwrap();
        assert!(manager.list().is_empty());
        assert!(matches!(manager.show("gone"), Err(SkillError::NotFound(_))));
    }
}
