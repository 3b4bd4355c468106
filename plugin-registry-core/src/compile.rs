//! Artifact compilation: rewrite, stage, bundle, then promote the whole batch.
//!
//! One call compiles every resolved input with a single bundler invocation.
//! Either every input yields `<output_dir>/<stem>.js` (plus a sidecar manifest
//! when metadata was found) or the call fails and the output directory holds
//! nothing from this run.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::config::BundlerConfig;
use crate::contract::{BundleOutput, BundleRequest, Bundler};
use crate::error::{CompileError, Diagnostic};
use crate::manifest::{extract_manifest, manifest_path, PluginManifest, MANIFEST_DIR};
use crate::select::ResolvedInput;
use crate::transform::{rewrite, SourceParser};

/// One bundled output, still attributed to the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub output_path: PathBuf,
    pub source_path: PathBuf,
    pub manifest_path: PathBuf,
}

impl CompiledArtifact {
    pub fn file_name(&self) -> String {
        self.output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct StagedInput {
    source_path: PathBuf,
    staged_path: PathBuf,
    stem: String,
    manifest: Option<PluginManifest>,
}

/// Compile `inputs` into `output_dir`, replacing whatever was there.
pub async fn compile<B>(
    inputs: &[ResolvedInput],
    output_dir: &Path,
    bundler: &B,
) -> Result<Vec<CompiledArtifact>, CompileError>
where
    B: Bundler + ?Sized,
{
    info!(inputs = inputs.len(), output_dir = %output_dir.display(), "[COMPILE] Starting compilation");

    if output_dir.exists() {
        ensure_no_source_inside(inputs, output_dir).await?;
        tokio::fs::remove_dir_all(output_dir).await?;
        debug!(path = %output_dir.display(), "[COMPILE] Removed previous output directory");
    }
    let parent = match output_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&parent).await?;
    let staging = tempfile::Builder::new()
        .prefix(".plugin-build-")
        .tempdir_in(&parent)?;
    let staged_src = staging.path().join("src");
    let staged_out = staging.path().join("out");
    tokio::fs::create_dir_all(&staged_src).await?;
    tokio::fs::create_dir_all(&staged_out).await?;

    let staged = stage_inputs(inputs, &staged_src).await?;

    let request = BundleRequest {
        entry_points: staged.iter().map(|s| s.staged_path.clone()).collect(),
        out_dir: staged_out.clone(),
    };
    info!(entry_points = request.entry_points.len(), "[COMPILE] Invoking bundler");
    match bundler.bundle(&request).await {
        Ok(BundleOutput { outputs }) => {
            debug!(outputs = outputs.len(), "[COMPILE] Bundler finished");
        }
        Err(CompileError::Diagnostics(diagnostics)) => {
            let diagnostics = attribute_diagnostics(diagnostics, &staged);
            for d in &diagnostics {
                error!(diagnostic = %d, "[COMPILE][ERROR] Bundler diagnostic");
            }
            return Err(CompileError::Diagnostics(diagnostics));
        }
        Err(e) => {
            error!(error = %e, "[COMPILE][ERROR] Bundler failed");
            return Err(e);
        }
    }

    for input in &staged {
        let produced = staged_out.join(format!("{}.js", input.stem));
        if !produced.is_file() {
            error!(path = %produced.display(), source = %input.source_path.display(), "[COMPILE][ERROR] Expected artifact missing");
            return Err(CompileError::MissingArtifact(
                output_dir.join(format!("{}.js", input.stem)),
            ));
        }
        if let Some(manifest) = &input.manifest {
            let path = manifest_path(&staged_out, &input.stem);
            tokio::fs::create_dir_all(staged_out.join(MANIFEST_DIR)).await?;
            let json = serde_json::to_vec_pretty(manifest).map_err(std::io::Error::other)?;
            tokio::fs::write(&path, json).await?;
        }
    }

    tokio::fs::rename(&staged_out, output_dir).await?;
    info!(output_dir = %output_dir.display(), artifacts = staged.len(), "[COMPILE] Promoted compiled batch");

    Ok(staged
        .into_iter()
        .map(|s| CompiledArtifact {
            output_path: output_dir.join(format!("{}.js", s.stem)),
            manifest_path: manifest_path(output_dir, &s.stem),
            source_path: s.source_path,
        })
        .collect())
}

/// The output directory is wiped before bundling, so it must not hold any input.
async fn ensure_no_source_inside(
    inputs: &[ResolvedInput],
    output_dir: &Path,
) -> Result<(), CompileError> {
    let output_dir = tokio::fs::canonicalize(output_dir).await?;
    for input in inputs {
        let source = tokio::fs::canonicalize(&input.path).await?;
        if source.starts_with(&output_dir) {
            error!(output_dir = %output_dir.display(), source = %source.display(), "[COMPILE][ERROR] Output directory contains a source");
            return Err(CompileError::OutputContainsSource {
                output_dir,
                source_path: input.path.clone(),
            });
        }
    }
    Ok(())
}

/// Rewrite every input into `staged_src`, collecting all per-file failures.
async fn stage_inputs(
    inputs: &[ResolvedInput],
    staged_src: &Path,
) -> Result<Vec<StagedInput>, CompileError> {
    let mut parser = SourceParser::new()?;
    let mut diagnostics = Vec::new();
    let mut staged = Vec::with_capacity(inputs.len());
    let mut stems: HashMap<String, PathBuf> = HashMap::new();

    for input in inputs {
        let stem = stem_of(&input.path);
        if let Some(first) = stems.get(&stem) {
            diagnostics.push(Diagnostic::for_file(
                &input.path,
                format!(
                    "artifact name `{stem}.js` collides with {}",
                    first.display()
                ),
            ));
            continue;
        }
        stems.insert(stem.clone(), input.path.clone());

        let source = match tokio::fs::read_to_string(&input.path).await {
            Ok(s) => s,
            Err(e) => {
                diagnostics.push(Diagnostic::for_file(&input.path, format!("cannot read source: {e}")));
                continue;
            }
        };
        let tree = match parser.parse(&input.path, &source) {
            Ok(tree) => tree,
            Err(d) => {
                diagnostics.push(d);
                continue;
            }
        };
        let rewritten = rewrite(&tree, &source);
        let manifest = extract_manifest(&tree, &source, &input.path);
        if manifest.is_none() {
            debug!(path = %input.path.display(), "[COMPILE] No metadata object found in source");
        }

        let file_name = input
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| format!("{stem}.ts").into());
        let staged_path = staged_src.join(file_name);
        tokio::fs::write(&staged_path, rewritten).await?;
        debug!(source = %input.path.display(), staged = %staged_path.display(), "[COMPILE] Staged rewritten source");

        staged.push(StagedInput {
            source_path: input.path.clone(),
            staged_path,
            stem,
            manifest,
        });
    }

    if diagnostics.is_empty() {
        Ok(staged)
    } else {
        for d in &diagnostics {
            error!(diagnostic = %d, "[COMPILE][ERROR] Source rejected");
        }
        Err(CompileError::Diagnostics(diagnostics))
    }
}

/// Map diagnostics on staged copies back to the original source paths.
fn attribute_diagnostics(diagnostics: Vec<Diagnostic>, staged: &[StagedInput]) -> Vec<Diagnostic> {
    diagnostics
        .into_iter()
        .map(|mut d| {
            if let Some(file) = &d.file {
                let original = staged.iter().find(|s| {
                    s.staged_path == *file || s.staged_path.file_name() == file.file_name()
                });
                if let Some(s) = original {
                    d.file = Some(s.source_path.clone());
                }
            }
            d
        })
        .collect()
}

/// Drives the `esbuild` command line.
pub struct EsbuildBundler {
    config: BundlerConfig,
}

impl EsbuildBundler {
    pub fn new(config: BundlerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Bundler for EsbuildBundler {
    async fn bundle(&self, request: &BundleRequest) -> Result<BundleOutput, CompileError> {
        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .args(&request.entry_points)
            .arg("--bundle")
            .arg(format!("--format={}", self.config.format))
            .arg(format!("--platform={}", self.config.platform))
            .arg("--tree-shaking=true")
            .arg(format!("--outdir={}", request.out_dir.display()))
            .arg("--log-level=error")
            .arg("--color=false");
        debug!(command = ?command, "[COMPILE] Running bundler");

        let output = command.output().await.map_err(|e| {
            error!(error = ?e, command = %self.config.command, "[COMPILE][ERROR] Failed to launch bundler");
            CompileError::Launch {
                command: self.config.command.clone(),
                source: e,
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut diagnostics = parse_esbuild_diagnostics(&stderr);
            if diagnostics.is_empty() {
                diagnostics.push(Diagnostic {
                    file: None,
                    line: None,
                    column: None,
                    message: format!("bundler exited with {}: {}", output.status, stderr.trim()),
                });
            }
            return Err(CompileError::Diagnostics(diagnostics));
        }

        Ok(BundleOutput {
            outputs: request
                .entry_points
                .iter()
                .map(|entry| request.out_dir.join(format!("{}.js", stem_of(entry))))
                .collect(),
        })
    }
}

/// Parse esbuild's plain-text error blocks:
///
/// ```text
/// ✘ [ERROR] Expected ";" but found "x"
///
///     src/a.ts:3:10:
///       3 │ let y = 1 x
/// ```
pub fn parse_esbuild_diagnostics(stderr: &str) -> Vec<Diagnostic> {
    let mut diagnostics: Vec<Diagnostic> = Vec::new();
    let mut awaiting_location = false;

    for line in stderr.lines() {
        if let Some(idx) = line.find("[ERROR]") {
            diagnostics.push(Diagnostic {
                file: None,
                line: None,
                column: None,
                message: line[idx + "[ERROR]".len()..].trim().to_string(),
            });
            awaiting_location = true;
            continue;
        }
        if !awaiting_location {
            continue;
        }
        let Some((file, line_no, col)) = parse_location(line.trim()) else {
            continue;
        };
        if let Some(last) = diagnostics.last_mut() {
            last.file = Some(PathBuf::from(file));
            last.line = Some(line_no);
            last.column = Some(col);
        }
        awaiting_location = false;
    }
    diagnostics
}

fn parse_location(line: &str) -> Option<(&str, usize, usize)> {
    let rest = line.strip_suffix(':')?;
    let mut parts = rest.rsplitn(3, ':');
    let col = parts.next()?.parse().ok()?;
    let line_no = parts.next()?.parse().ok()?;
    let file = parts.next()?;
    if file.is_empty() {
        return None;
    }
    Some((file, line_no, col))
}
