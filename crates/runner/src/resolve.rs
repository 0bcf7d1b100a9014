//! Resolution of `ansible.`-prefixed module URIs to an on-disk binary or
//! script (spec §6 "Module URI for the `ansible.` family").
//!
//! Grounded in `nanorunners/callers/ansiblecall.go`'s `ResolveModule`/
//! `AnsibleCollectionResolver` (the resolver source file itself wasn't part
//! of the retrieval pack, so the search order below follows spec §6
//! directly): a module URI is either core (`ansible.<namespace>.<plugin>`)
//! or collection-qualified (`ansible.<collection>.<namespace>.<plugin>`).
//! Each configured library root is tried in order; first match wins.

use std::path::PathBuf;

use crate::error::RunError;

const ANSIBLE_PREFIX: &str = "ansible.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Binary,
    Script,
}

#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub exe_path: PathBuf,
    pub kind: ModuleKind,
    /// The `plugins/action/<plugin>.py` wrapper, present only when `kind` is
    /// `Binary` and the module came from a collection.
    pub action_wrapper: Option<PathBuf>,
}

/// Parse `ansible.<namespace>.<plugin>` or
/// `ansible.<collection>.<namespace>.<plugin>` into its parts.
fn parse_uri(uri: &str) -> Result<(Option<&str>, &str, &str), RunError> {
    let rest = uri.strip_prefix(ANSIBLE_PREFIX).ok_or_else(|| {
        RunError::NonCompliant(format!("module uri '{uri}' is not in the 'ansible.' family"))
    })?;
    let parts: Vec<&str> = rest.split('.').collect();
    match parts.as_slice() {
        [namespace, plugin] => Ok((None, namespace, plugin)),
        [collection, namespace, plugin] => Ok((Some(*collection), namespace, plugin)),
        _ => Err(RunError::NonCompliant(format!(
            "module uri '{uri}' must have the form ansible.<namespace>.<plugin> or \
             ansible.<collection>.<namespace>.<plugin>"
        ))),
    }
}

/// Search `library_roots` in order for `uri`. Each root is treated as a
/// collection root when `uri` names a collection, otherwise as a core
/// modules root.
pub fn resolve(library_roots: &[PathBuf], uri: &str, os: &str, arch: &str) -> Result<ResolvedModule, RunError> {
    let (collection, namespace, plugin) = parse_uri(uri)?;

    for root in library_roots {
        if let Some(collection) = collection {
            let collection_root = root.join(collection);
            let binary = collection_root
                .join("library")
                .join(format!("{plugin}-{os}-{arch}"));
            if binary.is_file() {
                let wrapper = collection_root
                    .join("plugins")
                    .join("action")
                    .join(format!("{plugin}.py"));
                if !wrapper.is_file() {
                    return Err(RunError::NonCompliant(format!(
                        "binary module '{}' has no action wrapper at '{}'",
                        binary.display(),
                        wrapper.display()
                    )));
                }
                return Ok(ResolvedModule {
                    exe_path: binary,
                    kind: ModuleKind::Binary,
                    action_wrapper: Some(wrapper),
                });
            }
            let script = collection_root
                .join("plugins")
                .join("modules")
                .join(format!("{plugin}.py"));
            if script.is_file() {
                return Ok(ResolvedModule {
                    exe_path: script,
                    kind: ModuleKind::Script,
                    action_wrapper: None,
                });
            }
        } else {
            let script = root.join("modules").join(namespace).join(format!("{plugin}.py"));
            if script.is_file() {
                return Ok(ResolvedModule {
                    exe_path: script,
                    kind: ModuleKind::Script,
                    action_wrapper: None,
                });
            }
        }
    }

    Err(RunError::Runtime(format!(
        "could not resolve module '{uri}' under any of {} configured librar{}",
        library_roots.len(),
        if library_roots.len() == 1 { "y" } else { "ies" }
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn resolves_core_script_module() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("modules/commands/shell.py"));
        let resolved = resolve(&[dir.path().to_path_buf()], "ansible.commands.shell", "linux", "x86_64").unwrap();
        assert_eq!(resolved.kind, ModuleKind::Script);
    }

    #[test]
    fn resolves_collection_binary_with_wrapper() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("community.general/library/ping-linux-x86_64"));
        touch(&dir.path().join("community.general/plugins/action/ping.py"));
        let resolved = resolve(
            &[dir.path().to_path_buf()],
            "ansible.community.general.ping",
            "linux",
            "x86_64",
        )
        .unwrap();
        assert_eq!(resolved.kind, ModuleKind::Binary);
        assert!(resolved.action_wrapper.is_some());
    }

    #[test]
    fn binary_without_wrapper_is_non_compliant() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("community.general/library/ping-linux-x86_64"));
        let err = resolve(
            &[dir.path().to_path_buf()],
            "ansible.community.general.ping",
            "linux",
            "x86_64",
        )
        .unwrap_err();
        assert!(matches!(err, RunError::NonCompliant(_)));
    }

    #[test]
    fn unresolvable_module_is_a_runtime_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(&[dir.path().to_path_buf()], "ansible.commands.shell", "linux", "x86_64").unwrap_err();
        assert!(matches!(err, RunError::Runtime(_)));
    }

    #[test]
    fn malformed_uri_is_non_compliant() {
        let err = resolve(&[], "ansible.onlyone", "linux", "x86_64").unwrap_err();
        assert!(matches!(err, RunError::NonCompliant(_)));
    }
}
