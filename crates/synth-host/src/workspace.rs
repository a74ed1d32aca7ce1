//! Filesystem collaborators: directory listing, file reads confined to the
//! project root, and a whole-document JSON store.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SynthError};

pub const KNOWLEDGE_BASE_DOC: &str = "synth-consolidated.json";
pub const PROMPT_KB_DOC: &str = "socratic_kbs.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
    pub cwd: PathBuf,
    pub items: Vec<DirEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub path: PathBuf,
    pub content: String,
}

/// One knowledge unit collected from a `concept<N>-synth.json` task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptUnit {
    pub unit: Value,
    pub concept_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposeOutput {
    pub content: String,
    pub filename: String,
}

// ── Workspace ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// `root` should already be absolute and canonical.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute paths are taken as given (normalized). Relative paths are
    /// joined onto the root and must stay inside it.
    pub fn resolve(&self, input: &str) -> Result<PathBuf> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SynthError::invalid("Missing path parameter"));
        }
        let candidate = Path::new(input);
        if candidate.is_absolute() {
            return Ok(path_clean::clean(candidate));
        }
        let resolved = path_clean::clean(self.root.join(candidate));
        if !resolved.starts_with(&self.root) {
            return Err(SynthError::PathTraversal(resolved));
        }
        Ok(resolved)
    }

    /// List `dir` (the root when absent), directories first, then by name.
    pub async fn list_dir(&self, dir: Option<&str>) -> Result<DirListing> {
        let dir = match dir.map(str::trim).filter(|d| !d.is_empty()) {
            Some(dir) => self.resolve(dir)?,
            None => self.root.clone(),
        };
        let meta = tokio::fs::metadata(&dir)
            .await
            .map_err(|e| SynthError::io(&dir, e))?;
        if !meta.is_dir() {
            return Err(SynthError::invalid("Not a directory"));
        }

        let mut items = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SynthError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SynthError::io(&dir, e))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let size = match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => m.len(),
                _ => 0,
            };
            items.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                is_dir,
                size,
            });
        }
        sort_entries(&mut items);
        Ok(DirListing { cwd: dir, items })
    }

    pub async fn read_file(&self, path: &str) -> Result<FileContent> {
        let path = self.resolve(path)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SynthError::io(&path, e))?;
        if !meta.is_file() {
            return Err(SynthError::invalid("Not a file"));
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SynthError::io(&path, e))?;
        Ok(FileContent { path, content })
    }

    /// Every regular file under the root, as sorted root-relative paths.
    pub async fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| SynthError::io(&dir, e))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| SynthError::io(&dir, e))?
            {
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        files.push(rel.to_string_lossy().into_owned());
                    }
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn documents(&self) -> JsonDocumentStore {
        JsonDocumentStore {
            root: self.root.clone(),
        }
    }
}

fn sort_entries(items: &mut [DirEntry]) {
    items.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
}

// ── JSON documents ──────────────────────────────────────────────────

/// Whole-document read/replace of small JSON files in the project root.
#[derive(Debug, Clone)]
pub struct JsonDocumentStore {
    root: PathBuf,
}

impl JsonDocumentStore {
    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.root.join(name)),
            _ => Err(SynthError::invalid(format!("invalid document name: {name}"))),
        }
    }

    /// `Ok(None)` when the document does not exist.
    pub async fn read(&self, name: &str) -> Result<Option<Value>> {
        let path = self.path_for(name)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SynthError::io(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| SynthError::Json { path, source })
    }

    /// Replace the whole document.
    pub async fn replace(&self, name: &str, value: Value) -> Result<()> {
        let path = self.path_for(name)?;
        let target = path.clone();
        tokio::task::spawn_blocking(move || atomic_write_json(&target, &value))
            .await
            .map_err(|e| SynthError::io(&path, io::Error::other(e)))?
            .map_err(|e| SynthError::io(&path, e))
    }

    pub async fn save_knowledge_units(&self, units: Value) -> Result<()> {
        if !units.is_array() {
            return Err(SynthError::invalid("knowledge_units must be an array"));
        }
        let mut doc = Map::new();
        doc.insert("knowledge_units".into(), units);
        self.replace(KNOWLEDGE_BASE_DOC, Value::Object(doc)).await
    }

    /// Knowledge units from every `concept<N>-synth.json` in the root, in
    /// ascending `N`. Unreadable or malformed files are skipped.
    pub async fn concept_units(&self) -> Result<Vec<ConceptUnit>> {
        let mut concept_files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| SynthError::io(&self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SynthError::io(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(number) = concept_number(&name) {
                concept_files.push((number, name));
            }
        }
        concept_files.sort();

        let mut units = Vec::new();
        for (_, name) in concept_files {
            let doc = match self.read(&name).await {
                Ok(Some(doc)) => doc,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping concept output");
                    continue;
                }
            };
            let Some(Value::Array(items)) = doc.get("knowledge_units").cloned() else {
                continue;
            };
            units.extend(items.into_iter().map(|unit| ConceptUnit {
                unit,
                concept_file: name.clone(),
            }));
        }
        Ok(units)
    }

    /// The most recently modified `compose-*.md` in the root, if any.
    pub async fn latest_compose_output(&self) -> Result<Option<ComposeOutput>> {
        let mut latest: Option<(std::time::SystemTime, PathBuf, String)> = None;
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| SynthError::io(&self.root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SynthError::io(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with("compose-") && name.ends_with(".md")) {
                continue;
            }
            let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
                continue;
            };
            if latest.as_ref().map_or(true, |(newest, _, _)| modified > *newest) {
                latest = Some((modified, entry.path(), name));
            }
        }

        let Some((_, path, filename)) = latest else {
            return Ok(None);
        };
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SynthError::io(&path, e))?;
        Ok(Some(ComposeOutput { content, filename }))
    }

    /// Remove one prompt from the prompt knowledge base.
    pub async fn delete_prompt(&self, prompt_name: &str) -> Result<()> {
        if prompt_name.trim().is_empty() {
            return Err(SynthError::invalid("Prompt name is required"));
        }
        let mut doc = self
            .read(PROMPT_KB_DOC)
            .await?
            .ok_or_else(|| SynthError::not_found("KB file not found"))?;
        let removed = doc
            .as_object_mut()
            .and_then(|prompts| prompts.remove(prompt_name));
        if removed.is_none() {
            return Err(SynthError::not_found("Prompt not found in KB"));
        }
        self.replace(PROMPT_KB_DOC, doc).await
    }
}

/// `N` from `concept<N>-synth.json`.
fn concept_number(name: &str) -> Option<u64> {
    let digits = name.strip_prefix("concept")?.strip_suffix("-synth.json")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Atomic JSON write: write to a temp file, then rename over the target.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &json)?;
    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        (dir, Workspace::new(root))
    }

    #[test]
    fn relative_paths_resolve_under_root() {
        let (_dir, ws) = workspace();
        let resolved = ws.resolve("notes/./a.txt").unwrap();
        assert_eq!(resolved, ws.root().join("notes/a.txt"));
        assert_eq!(ws.resolve("x/../y").unwrap(), ws.root().join("y"));
    }

    #[test]
    fn escaping_the_root_is_rejected() {
        let (_dir, ws) = workspace();
        let err = ws.resolve("../outside.txt").unwrap_err();
        assert!(matches!(err, SynthError::PathTraversal(_)));
        let err = ws.resolve("a/../../b").unwrap_err();
        assert!(matches!(err, SynthError::PathTraversal(_)));
    }

    #[test]
    fn absolute_paths_pass_through() {
        let (_dir, ws) = workspace();
        assert_eq!(ws.resolve("/tmp/../etc").unwrap(), PathBuf::from("/etc"));
        assert!(matches!(ws.resolve("  ").unwrap_err(), SynthError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn listing_puts_directories_first() {
        let (_dir, ws) = workspace();
        fs::write(ws.root().join("b.txt"), "bb").unwrap();
        fs::write(ws.root().join("a.txt"), "a").unwrap();
        fs::create_dir(ws.root().join("zeta")).unwrap();
        fs::create_dir(ws.root().join("alpha")).unwrap();

        let listing = ws.list_dir(None).await.unwrap();
        let names: Vec<&str> = listing.items.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "a.txt", "b.txt"]);
        assert_eq!(listing.items[3].size, 2);
        assert_eq!(listing.items[0].size, 0);
        assert_eq!(listing.cwd, ws.root());
    }

    #[tokio::test]
    async fn listing_a_file_is_rejected() {
        let (_dir, ws) = workspace();
        fs::write(ws.root().join("f.txt"), "x").unwrap();
        let err = ws.list_dir(Some("f.txt")).await.unwrap_err();
        assert!(matches!(err, SynthError::InvalidArgument(_)));
        let err = ws.list_dir(Some("missing")).await.unwrap_err();
        assert!(matches!(err, SynthError::NotFound(_)));
    }

    #[tokio::test]
    async fn read_file_variants() {
        let (_dir, ws) = workspace();
        fs::write(ws.root().join("concepts.txt"), "one\ntwo\n").unwrap();
        fs::create_dir(ws.root().join("sub")).unwrap();

        let file = ws.read_file("concepts.txt").await.unwrap();
        assert_eq!(file.content, "one\ntwo\n");
        assert_eq!(file.path, ws.root().join("concepts.txt"));

        assert!(matches!(ws.read_file("nope.txt").await.unwrap_err(), SynthError::NotFound(_)));
        assert!(matches!(ws.read_file("sub").await.unwrap_err(), SynthError::InvalidArgument(_)));
        assert!(matches!(
            ws.read_file("../x").await.unwrap_err(),
            SynthError::PathTraversal(_)
        ));
    }

    #[tokio::test]
    async fn recursive_file_list_is_sorted_and_relative() {
        let (_dir, ws) = workspace();
        fs::create_dir_all(ws.root().join("d/e")).unwrap();
        fs::write(ws.root().join("d/e/deep.md"), "").unwrap();
        fs::write(ws.root().join("top.md"), "").unwrap();
        fs::write(ws.root().join("d/mid.md"), "").unwrap();
        assert_eq!(ws.list_files().await.unwrap(), vec!["d/e/deep.md", "d/mid.md", "top.md"]);
    }

    #[tokio::test]
    async fn document_store_read_and_replace() {
        let (_dir, ws) = workspace();
        let store = ws.documents();
        assert_eq!(store.read(KNOWLEDGE_BASE_DOC).await.unwrap(), None);

        store.save_knowledge_units(json!([{"id": 1}])).await.unwrap();
        let doc = store.read(KNOWLEDGE_BASE_DOC).await.unwrap().unwrap();
        assert_eq!(doc, json!({"knowledge_units": [{"id": 1}]}));

        // Replace, not merge.
        store.save_knowledge_units(json!([])).await.unwrap();
        let doc = store.read(KNOWLEDGE_BASE_DOC).await.unwrap().unwrap();
        assert_eq!(doc, json!({"knowledge_units": []}));

        let err = store.save_knowledge_units(json!({"no": "array"})).await.unwrap_err();
        assert!(matches!(err, SynthError::InvalidArgument(_)));
        assert!(!ws.root().join("synth-consolidated.json.tmp").exists());
    }

    #[tokio::test]
    async fn document_names_cannot_escape() {
        let (_dir, ws) = workspace();
        let err = ws.documents().read("../x.json").await.unwrap_err();
        assert!(matches!(err, SynthError::InvalidArgument(_)));
    }

    #[test]
    fn concept_file_names() {
        assert_eq!(concept_number("concept12-synth.json"), Some(12));
        assert_eq!(concept_number("concept-synth.json"), None);
        assert_eq!(concept_number("concept1a-synth.json"), None);
        assert_eq!(concept_number("concept3-synth.json.tmp"), None);
    }

    #[tokio::test]
    async fn concept_units_follow_concept_order() {
        let (_dir, ws) = workspace();
        let root = ws.root();
        fs::write(root.join("concept10-synth.json"), r#"{"knowledge_units":["j"]}"#).unwrap();
        fs::write(root.join("concept2-synth.json"), r#"{"knowledge_units":["b","c"]}"#).unwrap();
        fs::write(root.join("concept1-synth.json"), r#"{"knowledge_units":["a"]}"#).unwrap();
        fs::write(root.join("concept3-synth.json"), "not json").unwrap();
        fs::write(root.join("concept4-synth.json"), r#"{"other":1}"#).unwrap();

        let units = ws.documents().concept_units().await.unwrap();
        let flat: Vec<(String, &str)> = units
            .iter()
            .map(|u| (u.unit.as_str().unwrap().to_string(), u.concept_file.as_str()))
            .collect();
        assert_eq!(
            flat,
            vec![
                ("a".to_string(), "concept1-synth.json"),
                ("b".to_string(), "concept2-synth.json"),
                ("c".to_string(), "concept2-synth.json"),
                ("j".to_string(), "concept10-synth.json"),
            ]
        );
    }

    #[tokio::test]
    async fn latest_compose_output_by_mtime() {
        let (_dir, ws) = workspace();
        let store = ws.documents();
        assert_eq!(store.latest_compose_output().await.unwrap(), None);

        let old = ws.root().join("compose-b.md");
        fs::write(&old, "old").unwrap();
        fs::write(ws.root().join("compose-a.md"), "new").unwrap();
        fs::write(ws.root().join("compose-notes.txt"), "ignored").unwrap();
        let past = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .unwrap()
            .set_modified(past)
            .unwrap();

        let output = store.latest_compose_output().await.unwrap().unwrap();
        assert_eq!(output.filename, "compose-a.md");
        assert_eq!(output.content, "new");
    }

    #[tokio::test]
    async fn prompt_deletion() {
        let (_dir, ws) = workspace();
        let store = ws.documents();
        assert!(matches!(
            store.delete_prompt("a").await.unwrap_err(),
            SynthError::NotFound(_)
        ));

        store
            .replace(PROMPT_KB_DOC, json!({"a": {"text": "1"}, "b": {"text": "2"}}))
            .await
            .unwrap();
        store.delete_prompt("a").await.unwrap();
        assert_eq!(
            store.read(PROMPT_KB_DOC).await.unwrap().unwrap(),
            json!({"b": {"text": "2"}})
        );
        assert!(matches!(
            store.delete_prompt("a").await.unwrap_err(),
            SynthError::NotFound(_)
        ));
    }
}
