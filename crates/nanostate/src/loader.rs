//! State Loader & Indexer (component B).
//!
//! Grounded in `nanostate/statefinder.go` and `nanostate/compiler/ncmp.go`'s
//! `LoadFile`/`loadBytes`: walk one or more roots for `.st` files, partially
//! parse each far enough to learn its `id`, and register it so the compiler
//! can find it by id later without re-walking the filesystem every time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use otree::OTree;
use walkdir::WalkDir;

use crate::error::Error;

const STATE_SUFFIX: &str = "st";
const SCRIPT_SUFFIX: &str = "fn";

/// Metadata about a single indexed state file.
#[derive(Debug, Clone)]
pub struct StateMeta {
    pub id: String,
    pub filename: String,
    pub absolute_path: PathBuf,
    pub companion_script_path: Option<PathBuf>,
}

/// Walks configured roots for `.st` files and indexes them by id, by
/// filename, and by a registration-order ordinal (§4.B: "registers three
/// mappings: `id → meta`, `filename → meta`, `int → meta`"). Does not hold
/// parsed document bodies — only enough metadata to `load()` them on demand.
#[derive(Debug, Default)]
pub struct Indexer {
    roots: Vec<PathBuf>,
    by_id: HashMap<String, StateMeta>,
    by_filename: HashMap<String, StateMeta>,
    by_ordinal: HashMap<usize, StateMeta>,
    next_ordinal: usize,
}

impl Indexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_roots<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.roots.extend(paths.into_iter().map(Into::into));
    }

    /// Walk every configured root recursively, registering every regular
    /// `.st` file found. Duplicate ids across roots: first one wins, the
    /// second is logged and ignored. Parse failures are logged and skipped.
    /// A state file with no `id` field is logged and skipped (not fatal).
    pub fn index(&mut self) {
        let roots = self.roots.clone();
        for root in &roots {
            for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(STATE_SUFFIX) {
                    continue;
                }
                self.index_file(path);
            }
        }
    }

    fn index_file(&mut self, path: &Path) {
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                log::warn!("skipping {}: {e}", path.display());
                return;
            }
        };
        let doc: serde_yaml::Value = match serde_yaml::from_str(&source) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("skipping {}: parse error: {e}", path.display());
                return;
            }
        };
        let id = match doc.get("id").and_then(|v| v.as_str()) {
            Some(id) => id.to_owned(),
            None => {
                log::warn!("skipping {}: no 'id' field", path.display());
                return;
            }
        };
        if self.by_id.contains_key(&id) {
            log::warn!(
                "duplicate state id '{id}' at {}; keeping first one indexed",
                path.display()
            );
            return;
        }

        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let companion_script_path = companion_path(path).filter(|p| p.is_file());

        let meta = StateMeta {
            id: id.clone(),
            filename: filename.clone(),
            absolute_path: path.to_path_buf(),
            companion_script_path,
        };
        log::debug!("indexed state '{id}' at {}", path.display());
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.by_ordinal.insert(ordinal, meta.clone());
        self.by_filename.insert(filename, meta.clone());
        self.by_id.insert(id, meta);
    }

    pub fn get_by_id(&self, id: &str) -> Result<&StateMeta, Error> {
        self.by_id
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Look up by the ordinal assigned at registration time (the `int →
    /// meta` mapping of §4.B), in the order `index()` discovered states.
    pub fn get_by_ordinal(&self, ordinal: usize) -> Result<&StateMeta, Error> {
        self.by_ordinal
            .get(&ordinal)
            .ok_or_else(|| Error::NotFound(format!("no state registered at ordinal {ordinal}")))
    }

    pub fn get_by_filename(&self, name: &str) -> Result<&StateMeta, Error> {
        self.by_filename
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_owned()))
    }
}

fn companion_path(state_path: &Path) -> Option<PathBuf> {
    let stem = state_path.file_stem()?;
    Some(state_path.with_file_name(stem).with_extension(SCRIPT_SUFFIX))
}

/// Parse a single state file at `path` into an [`OTree`]. Also returns the
/// companion script path, if a sibling `.fn` file with the same stem exists.
pub fn load(path: &Path) -> Result<(OTree, Option<PathBuf>), Error> {
    let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.display().to_string(),
        source,
    })?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&source).map_err(|source| Error::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let tree = OTree::from_ordered_document(&doc)?;
    let companion = companion_path(path).filter(|p| p.is_file());
    Ok((tree, companion))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_state(dir: &Path, name: &str, id: &str, extra: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        writeln!(f, "id: {id}\ndescription: d\nstate:\n{extra}").unwrap();
    }

    #[test]
    fn indexes_states_by_id_and_filename() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), "a.st", "a", "  g1: []");
        let mut indexer = Indexer::new();
        indexer.add_roots([dir.path()]);
        indexer.index();
        assert_eq!(indexer.get_by_id("a").unwrap().filename, "a.st");
        assert_eq!(indexer.get_by_filename("a.st").unwrap().id, "a");
    }

    #[test]
    fn indexes_states_by_registration_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), "a.st", "a", "  g1: []");
        write_state(dir.path(), "b.st", "b", "  g1: []");
        let mut indexer = Indexer::new();
        indexer.add_roots([dir.path()]);
        indexer.index();
        let mut ids: Vec<String> = (0..2)
            .map(|i| indexer.get_by_ordinal(i).unwrap().id.clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(indexer.get_by_ordinal(2).is_err());
    }

    #[test]
    fn missing_id_is_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("noid.st")).unwrap();
        writeln!(f, "description: d\nstate:\n  g1: []").unwrap();
        let mut indexer = Indexer::new();
        indexer.add_roots([dir.path()]);
        indexer.index();
        assert!(indexer.get_by_filename("noid.st").is_err());
    }

    #[test]
    fn duplicate_id_across_roots_keeps_first() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        write_state(dir1.path(), "a.st", "dup", "  g1: []");
        write_state(dir2.path(), "b.st", "dup", "  g2: []");
        let mut indexer = Indexer::new();
        indexer.add_roots([dir1.path(), dir2.path()]);
        indexer.index();
        assert_eq!(indexer.get_by_id("dup").unwrap().filename, "a.st");
    }

    #[test]
    fn companion_script_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_state(dir.path(), "a.st", "a", "  g1: []");
        std::fs::write(dir.path().join("a.fn"), "fn always() { true }").unwrap();
        let mut indexer = Indexer::new();
        indexer.add_roots([dir.path()]);
        indexer.index();
        let meta = indexer.get_by_id("a").unwrap();
        assert!(meta.companion_script_path.is_some());
    }
}
