//! Source selection: resolve configured patterns to existing input files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One existing input file, remembering the pattern that matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInput {
    pub path: PathBuf,
    pub pattern: String,
}

/// Result of resolving all patterns. Empty `inputs` means nothing to build.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub inputs: Vec<ResolvedInput>,
    /// Literal paths that do not exist and globs that matched nothing.
    pub missing: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn anchor(base_dir: &Path, pattern: &str) -> PathBuf {
    let p = Path::new(pattern);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Resolve `patterns` (in order) against `base_dir`.
///
/// Glob matches are sorted within their pattern; duplicates across patterns
/// keep their first position. Directories never count as inputs. A malformed
/// glob is reported as missing rather than failing selection.
pub fn resolve(patterns: &[String], base_dir: &Path) -> Selection {
    info!(patterns = ?patterns, base_dir = %base_dir.display(), "[SELECT] Resolving source patterns");
    let mut selection = Selection::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();

    for pattern in patterns {
        let matches: Vec<PathBuf> = if is_glob(pattern) {
            let full = anchor(base_dir, pattern);
            let full = full.to_string_lossy();
            match glob::glob(&full) {
                Ok(paths) => {
                    let mut found: Vec<PathBuf> = paths
                        .filter_map(|entry| match entry {
                            Ok(path) => Some(path),
                            Err(e) => {
                                warn!(error = %e, pattern = %pattern, "[SELECT] Unreadable glob entry");
                                None
                            }
                        })
                        .filter(|p| p.is_file())
                        .collect();
                    found.sort();
                    found
                }
                Err(e) => {
                    warn!(error = %e, pattern = %pattern, "[SELECT] Invalid glob pattern");
                    Vec::new()
                }
            }
        } else {
            let full = anchor(base_dir, pattern);
            if full.is_file() {
                vec![full]
            } else {
                Vec::new()
            }
        };

        if matches.is_empty() {
            warn!(pattern = %pattern, "[SELECT] Pattern matched no existing file");
            selection.missing.push(pattern.clone());
            continue;
        }

        for path in matches {
            if seen.insert(path.clone()) {
                debug!(path = %path.display(), pattern = %pattern, "[SELECT] Resolved input");
                selection.inputs.push(ResolvedInput {
                    path,
                    pattern: pattern.clone(),
                });
            } else {
                debug!(path = %path.display(), "[SELECT] Skipping duplicate input");
            }
        }
    }

    info!(
        inputs = selection.inputs.len(),
        missing = selection.missing.len(),
        "[SELECT] Selection complete"
    );
    selection
}
