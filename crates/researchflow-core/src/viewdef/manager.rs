//! On-disk library of ViewDefinitions, one `<name>.json` file per view.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::builtin;
use super::model::{is_identifier, ViewDefinition};
use super::ViewError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewSummary {
    pub name: String,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub columns: Vec<String>,
}

impl From<&ViewDefinition> for ViewSummary {
    fn from(view: &ViewDefinition) -> Self {
        Self {
            name: view.name.clone(),
            resource: view.resource.clone(),
            title: view.title.clone(),
            description: view.description.clone(),
            columns: view.column_names(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewDefinitionManager {
    dir: PathBuf,
}

impl ViewDefinitionManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ViewError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ViewError> {
        if !is_identifier(name) {
            return Err(ViewError::Invalid(format!("invalid view name '{}'", name)));
        }
        Ok(self.dir.join(format!("{}.json", name)))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Validate and write a view, replacing any existing file of that name.
    pub fn save(&self, view: &ViewDefinition) -> Result<PathBuf, ViewError> {
        view.validate()?;
        let path = self.path_for(&view.name)?;
        let json = serde_json::to_string_pretty(view)
            .map_err(|e| ViewError::Invalid(e.to_string()))?;
        std::fs::write(&path, json)?;
        tracing::info!("[ViewManager] Saved view {} to {}", view.name, path.display());
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<ViewDefinition, ViewError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(ViewError::NotFound(name.to_string()));
        }
        let view = ViewDefinition::from_json(&std::fs::read_to_string(&path)?)?;
        view.validate()?;
        Ok(view)
    }

    /// Summaries of every loadable view, sorted by name. Unreadable files are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<ViewSummary>, ViewError> {
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(ViewError::from)
                .and_then(|s| ViewDefinition::from_json(&s));
            match parsed {
                Ok(view) => summaries.push(ViewSummary::from(&view)),
                Err(e) => tracing::warn!("[ViewManager] Skipping {}: {}", path.display(), e),
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }

    pub fn delete(&self, name: &str) -> Result<bool, ViewError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        tracing::info!("[ViewManager] Deleted view {}", name);
        Ok(true)
    }

    /// Write the bundled views that are not already present (all of them
    /// when `overwrite`). Returns the names written.
    pub fn install_builtins(&self, overwrite: bool) -> Result<Vec<String>, ViewError> {
        let mut written = Vec::new();
        for view in builtin::all() {
            if overwrite || !self.exists(&view.name) {
                self.save(&view)?;
                written.push(view.name);
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_load_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ViewDefinitionManager::new(dir.path().join("views")).unwrap();

        let view = ViewDefinition::from_value(json!({
            "name": "active_patients",
            "resource": "Patient",
            "where": [{ "path": "active = true" }],
            "select": [
                { "column": [{ "name": "id", "path": "id" }],
                  "forEach": "name",
                  "select": [{ "column": [{ "name": "family", "path": "family" }] }] }
            ]
        }))
        .unwrap();
        manager.save(&view).unwrap();
        assert_eq!(manager.load("active_patients").unwrap(), view);

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].columns, vec!["id", "family"]);

        assert!(manager.delete("active_patients").unwrap());
        assert!(!manager.delete("active_patients").unwrap());
        assert!(matches!(manager.load("active_patients"), Err(ViewError::NotFound(_))));
    }

    #[test]
    fn test_rejects_invalid_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ViewDefinitionManager::new(dir.path()).unwrap();
        assert!(matches!(manager.load("../etc/passwd"), Err(ViewError::Invalid(_))));

        let bad = ViewDefinition::from_value(json!({
            "name": "bad", "resource": "Patient", "select": []
        }))
        .unwrap();
        assert!(manager.save(&bad).is_err());
        assert!(!manager.exists("bad"));
    }

    #[test]
    fn test_install_builtins_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ViewDefinitionManager::new(dir.path()).unwrap();
        assert_eq!(manager.install_builtins(false).unwrap().len(), builtin::all().len());
        assert!(manager.install_builtins(false).unwrap().is_empty());
        assert_eq!(manager.install_builtins(true).unwrap().len(), builtin::all().len());
    }
}
