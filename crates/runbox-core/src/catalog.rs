//! Algorithm catalog
//!
//! The core looks algorithms up through [`AlgorithmRepository`]. The bundled
//! implementation reads a YAML list of specs once at start-up.

use crate::errors::ConfigError;
use crate::model::AlgorithmSpec;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A registered algorithm and the directory holding its installed files.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub spec: AlgorithmSpec,
    pub app_dir: PathBuf,
}

#[async_trait]
pub trait AlgorithmRepository: Send + Sync {
    async fn find(&self, id: &str) -> Option<CatalogEntry>;
}

#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl FileCatalog {
    pub async fn load(path: &Path, uploads_dir: &Path) -> Result<Self, ConfigError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Algorithm catalog {} not found, starting empty", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let catalog = Self::from_str(&content, uploads_dir)?;
        log::info!(
            "Loaded {} algorithm(s) from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn from_str(content: &str, uploads_dir: &Path) -> Result<Self, ConfigError> {
        let specs: Vec<AlgorithmSpec> = if content.trim().is_empty() {
            Vec::new()
        } else {
            serde_yaml::from_str(content)?
        };
        let mut catalog = Self::default();
        for spec in specs {
            catalog.insert(spec, uploads_dir)?;
        }
        Ok(catalog)
    }

    /// Accepts a spec after its acceptance checks pass.
    pub fn insert(&mut self, spec: AlgorithmSpec, uploads_dir: &Path) -> Result<(), ConfigError> {
        spec.check()?;
        if self.entries.contains_key(&spec.id) {
            return Err(ConfigError::Invalid(format!(
                "duplicate algorithm id '{}'",
                spec.id
            )));
        }
        let spec = spec.normalized();
        let app_dir = uploads_dir.join(&spec.id);
        self.entries
            .insert(spec.id.clone(), CatalogEntry { spec, app_dir });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl AlgorithmRepository for FileCatalog {
    async fn find(&self, id: &str) -> Option<CatalogEntry> {
        self.entries.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParameterKind, OUTPUT_DIR_PARAM};

    const CATALOG: &str = r#"
- id: wordcount
  entryApp:
    appName: wc
  parameters:
    - name: in
      type: file
      flag: "-l"
      position: 0
      options:
        required: true
- id: plot
  entry:
    path: plot.sh
    localFile: true
  files: [plot.sh]
  parameters:
    - name: title
      type: primitive
      position: 0
  output:
    stdout:
      alias: log
    files:
      - alias: images
        fileRgx: "\\.png$"
"#;

    #[tokio::test]
    async fn test_loads_and_normalizes_specs() {
        let catalog = FileCatalog::from_str(CATALOG, Path::new("/srv/uploads")).unwrap();
        assert_eq!(catalog.len(), 2);

        let wc = catalog.find("wordcount").await.unwrap();
        assert_eq!(wc.spec.entry.path, "wc");
        assert!(!wc.spec.entry.is_local_file);
        assert_eq!(wc.spec.parameters[0].kind, ParameterKind::File);
        assert!(wc.spec.parameter(OUTPUT_DIR_PARAM).is_none());

        let plot = catalog.find("plot").await.unwrap();
        assert_eq!(plot.app_dir, PathBuf::from("/srv/uploads/plot"));
        assert_eq!(plot.spec.output.stdout.alias, "log");
        assert_eq!(plot.spec.output.files[0].alias_group, "images");
        assert_eq!(plot.spec.parameter(OUTPUT_DIR_PARAM).unwrap().position, 1);

        assert!(catalog.find("missing").await.is_none());
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let yaml = "- id: a\n  entry: {path: echo}\n- id: a\n  entry: {path: echo}\n";
        assert!(matches!(
            FileCatalog::from_str(yaml, Path::new("/u")),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_catalog_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let catalog = FileCatalog::load(&dir.path().join("none.yaml"), dir.path())
            .await
            .unwrap();
        assert!(catalog.is_empty());
    }
}
