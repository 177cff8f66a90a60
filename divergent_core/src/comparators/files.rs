//! File existence, metadata, and fuzzy content comparison.

use crate::config::ConfigError;
use crate::plugin::{Comparator, ComparisonResult, CrashResult, TraceHook, Value, value_to_string};
use crate::trace::Trace;
use nix::unistd::{Group, User};
use serde::Deserialize;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

fn default_similarity() -> u32 {
    100
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
enum PathType {
    #[default]
    File,
    Directory,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum ModeRule {
    Int(u32),
    Str(String),
    /// The expected mode comes from a fuzz variable's value at compare time.
    Variable {
        variable: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum OwnerEntry {
    Enabled(bool),
    Rules {
        #[serde(default)]
        user: Option<OwnerRule>,
        #[serde(default)]
        group: Option<OwnerRule>,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum OwnerRule {
    Match(bool),
    Id(u32),
    Name(String),
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    /// Path to compare, relative to the trace working directory.
    filename: String,
    #[serde(default = "default_true")]
    exists: bool,
    #[serde(default, rename = "type")]
    path_type: PathType,
    #[serde(default)]
    mode: Option<ModeRule>,
    /// Minimum content similarity percentage; 100 requires identical files.
    #[serde(default = "default_similarity")]
    similarity: u32,
    /// Compare against another file within the same trace instead of the
    /// peer trace.
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    owner: Option<OwnerEntry>,
}

/// Expected mode, resolved per trace because it may reference a variable.
#[derive(Debug, Clone)]
enum ModeCheck {
    None,
    Fixed(u32),
    Variable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdCheck {
    /// Compare against the peer trace's owner.
    Matching,
    Ignore,
    Expect(u32),
}

#[derive(Debug, Clone, Copy)]
struct OwnerCheck {
    user: IdCheck,
    group: IdCheck,
}

impl OwnerCheck {
    /// Check the file's owner against explicit uid/gid expectations.
    fn verify(&self, path: &Path) -> std::io::Result<bool> {
        let meta = path.symlink_metadata()?;
        if let IdCheck::Expect(uid) = self.user {
            if meta.uid() != uid {
                return Ok(false);
            }
        }
        if let IdCheck::Expect(gid) = self.group {
            if meta.gid() != gid {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn matches(original: &Path, debloated: &Path) -> std::io::Result<bool> {
        let a = original.symlink_metadata()?;
        let b = debloated.symlink_metadata()?;
        Ok((a.uid(), a.gid()) == (b.uid(), b.gid()))
    }
}

/// Compares a file produced by the traced process: existence, type, mode,
/// ownership, and fuzzy content similarity. Content similarity splits both
/// files into content-defined chunks and measures the share of chunk digests
/// the files have in common, so insertions only perturb nearby chunks.
pub struct FileComparator {
    filename: String,
    exists: bool,
    path_type: PathType,
    mode: ModeCheck,
    similarity: u32,
    target: Option<String>,
    owner: Option<OwnerCheck>,
}

pub fn file(config: &Value) -> Result<Box<dyn Comparator>, ConfigError> {
    let config: FileConfig = serde_yaml::from_value(config.clone())
        .map_err(|err| ConfigError::invalid("file", err.to_string()))?;

    let mode = match config.mode {
        None => ModeCheck::None,
        Some(ModeRule::Int(digits)) => ModeCheck::Fixed(parse_octal(&digits.to_string())?),
        Some(ModeRule::Str(digits)) => ModeCheck::Fixed(parse_octal(&digits)?),
        Some(ModeRule::Variable { variable }) => ModeCheck::Variable(variable),
    };

    let owner = config.owner.map(|entry| resolve_owner(entry)).transpose()?;

    // Similarity only applies to regular files that must exist.
    let similarity = if !config.exists || config.path_type == PathType::Directory {
        0
    } else {
        config.similarity
    };

    Ok(Box::new(FileComparator {
        filename: config.filename,
        exists: config.exists,
        path_type: config.path_type,
        mode,
        similarity,
        target: config.target,
        owner,
    }))
}

fn parse_octal(digits: &str) -> Result<u32, ConfigError> {
    u32::from_str_radix(digits, 8)
        .map_err(|err| ConfigError::invalid("mode", format!("{digits}: {err}")))
}

fn resolve_owner(entry: OwnerEntry) -> Result<OwnerCheck, ConfigError> {
    let (user, group) = match entry {
        OwnerEntry::Enabled(true) => (None, None),
        OwnerEntry::Enabled(false) => (Some(OwnerRule::Match(false)), Some(OwnerRule::Match(false))),
        OwnerEntry::Rules { user, group } => (user, group),
    };

    let user = match user {
        None | Some(OwnerRule::Match(true)) => IdCheck::Matching,
        Some(OwnerRule::Match(false)) => IdCheck::Ignore,
        Some(OwnerRule::Id(uid)) => IdCheck::Expect(uid),
        Some(OwnerRule::Name(name)) => {
            let user = User::from_name(&name)
                .map_err(|err| ConfigError::invalid("owner.user", err.to_string()))?
                .ok_or_else(|| ConfigError::invalid("owner.user", format!("unknown user: {name}")))?;
            IdCheck::Expect(user.uid.as_raw())
        }
    };
    let group = match group {
        None | Some(OwnerRule::Match(true)) => IdCheck::Matching,
        Some(OwnerRule::Match(false)) => IdCheck::Ignore,
        Some(OwnerRule::Id(gid)) => IdCheck::Expect(gid),
        Some(OwnerRule::Name(name)) => {
            let group = Group::from_name(&name)
                .map_err(|err| ConfigError::invalid("owner.group", err.to_string()))?
                .ok_or_else(|| {
                    ConfigError::invalid("owner.group", format!("unknown group: {name}"))
                })?;
            IdCheck::Expect(group.gid.as_raw())
        }
    };

    Ok(OwnerCheck { user, group })
}

impl FileComparator {
    /// Enforce the `exists`, `type`, and `mode` options, returning an error
    /// message on the first violation.
    fn check_file(&self, trace: &Trace, path: &Path) -> Option<String> {
        if self.exists {
            if !path.exists() {
                return Some(format!("file does not exist: {}", self.filename));
            }
            if self.path_type == PathType::File && !path.is_file() {
                return Some(format!("path is not a normal file: {}", self.filename));
            }
            if self.path_type == PathType::Directory && !path.is_dir() {
                return Some(format!("path is not a directory: {}", self.filename));
            }
        } else if path.exists() {
            return Some(format!("file exists: {}", self.filename));
        }

        let expected = match &self.mode {
            ModeCheck::None => None,
            ModeCheck::Fixed(mode) => Some(*mode),
            ModeCheck::Variable(name) => {
                let value = trace.context.values.get(name)?;
                parse_octal(&value_to_string(value)).ok()
            }
        };
        if let (Some(expected), Ok(meta)) = (expected, path.metadata()) {
            let mode = meta.mode() & 0o777;
            if mode != expected {
                return Some(format!(
                    "file mode does not match expected: mode={mode:o}, expected={expected:o}"
                ));
            }
        }
        None
    }

    /// Whole-file digest plus content-defined chunk digests, memoized in the
    /// trace cache so repeated comparators against the same original file
    /// hash it once.
    fn file_hashes(&self, trace: &Trace, path: &Path) -> std::io::Result<(String, Vec<String>)> {
        let digest_key = format!("{}:md5", path.display());
        let chunks_key = format!("{}:chunks", path.display());
        if let (Some(digest), Some(chunks)) =
            (trace.cache_get(&digest_key), trace.cache_get(&chunks_key))
        {
            return Ok((digest, chunks.split(',').map(str::to_string).collect()));
        }

        let data = std::fs::read(path)?;
        let digest = format!("{:x}", md5::compute(&data));
        let chunks: Vec<String> = chunk_boundaries(&data)
            .windows(2)
            .map(|span| format!("{:x}", md5::compute(&data[span[0]..span[1]])))
            .collect();

        trace.cache_put(digest_key, digest.clone());
        trace.cache_put(chunks_key, chunks.join(","));
        Ok((digest, chunks))
    }

    /// Similarity of two files as a whole percentage.
    fn compare_files(
        &self,
        cache_trace: &Trace,
        source: &Path,
        target: &Path,
    ) -> std::io::Result<u32> {
        let (source_digest, source_chunks) = self.file_hashes(cache_trace, source)?;
        let (target_digest, target_chunks) = self.file_hashes(cache_trace, target)?;
        if source_digest == target_digest {
            return Ok(100);
        }
        Ok(chunk_similarity(&source_chunks, &target_chunks))
    }

    fn similarity_error(&self, similarity: u32) -> String {
        format!(
            "file content does not meet similarity requirement: {} ({similarity}% similar)",
            self.filename
        )
    }
}

/// Chunk boundary offsets (first 0 and final len included) computed with a
/// sliding-window rolling hash. The hash depends only on the last 32 bytes,
/// so boundaries resynchronize shortly after an insertion and local edits
/// only perturb nearby chunks. Chunks have a 128 byte minimum so
/// pathological inputs cannot degrade into per-byte chunks.
fn chunk_boundaries(data: &[u8]) -> Vec<usize> {
    const MIN_CHUNK: usize = 128;
    const WINDOW: usize = 32;
    const BASE: u64 = 31;
    const BOUNDARY_MASK: u64 = 0x1ff;

    // BASE^WINDOW, for removing the byte that leaves the window.
    let base_pow: u64 = (0..WINDOW).fold(1u64, |acc, _| acc.wrapping_mul(BASE));

    let mut boundaries = vec![0];
    let mut start = 0;
    let mut hash: u64 = 0;
    for (index, &byte) in data.iter().enumerate() {
        hash = hash.wrapping_mul(BASE).wrapping_add(u64::from(byte));
        if index >= WINDOW {
            let out = u64::from(data[index - WINDOW]);
            hash = hash.wrapping_sub(out.wrapping_mul(base_pow));
        }
        if index + 1 - start >= MIN_CHUNK && hash & BOUNDARY_MASK == 0 {
            boundaries.push(index + 1);
            start = index + 1;
        }
    }
    if *boundaries.last().unwrap() != data.len() {
        boundaries.push(data.len());
    }
    boundaries
}

fn chunk_similarity(source: &[String], target: &[String]) -> u32 {
    if source.is_empty() && target.is_empty() {
        return 100;
    }
    let mut remaining: Vec<&String> = target.iter().collect();
    let mut common = 0usize;
    for chunk in source {
        if let Some(pos) = remaining.iter().position(|other| *other == chunk) {
            remaining.swap_remove(pos);
            common += 1;
        }
    }
    (200 * common / (source.len() + target.len())) as u32
}

impl TraceHook for FileComparator {}

impl Comparator for FileComparator {
    fn id(&self) -> &str {
        "file"
    }

    fn verify_original(&self, original: &Trace) -> Option<CrashResult> {
        let path = original.cwd.join(&self.filename);
        if let Some(error) = self.check_file(original, &path) {
            return Some(CrashResult::with_comparator(original, error, self.id()));
        }
        if !path.exists() {
            return None;
        }

        if let Some(owner) = &self.owner {
            if !owner.verify(&path).unwrap_or(false) {
                return Some(CrashResult::with_comparator(
                    original,
                    "unexpected file owner",
                    self.id(),
                ));
            }
        }

        if self.similarity == 0 {
            return None;
        }

        // Prime the cache so debloated comparisons reuse the hashes.
        if self.file_hashes(original, &path).is_err() {
            return Some(CrashResult::with_comparator(
                original,
                format!("failed to read file: {}", self.filename),
                self.id(),
            ));
        }

        if let Some(target) = &self.target {
            let similarity = self
                .compare_files(original, &path, &original.cwd.join(target))
                .unwrap_or(0);
            if similarity < self.similarity {
                return Some(CrashResult::with_comparator(
                    original,
                    self.similarity_error(similarity),
                    self.id(),
                ));
            }
        }
        None
    }

    fn compare(&self, original: &Trace, debloated: &Trace) -> ComparisonResult {
        let path = debloated.cwd.join(&self.filename);
        let peer: PathBuf = match &self.target {
            // Compare two files within the debloated trace.
            Some(target) => debloated.cwd.join(target),
            None => original.cwd.join(&self.filename),
        };

        if let Some(error) = self.check_file(debloated, &path) {
            return ComparisonResult::error(self.id(), debloated, error);
        }
        if !path.exists() {
            return ComparisonResult::success(self.id(), debloated);
        }
        if !peer.exists() {
            return ComparisonResult::error(
                self.id(),
                debloated,
                format!("comparison target file does not exist: {}", peer.display()),
            );
        }

        if let Some(owner) = self.owner {
            let matched = match (owner.user, owner.group) {
                (IdCheck::Ignore, IdCheck::Ignore) => true,
                _ => OwnerCheck::matches(&peer, &path).unwrap_or(false)
                    && owner.verify(&path).unwrap_or(false),
            };
            if !matched {
                return ComparisonResult::error("file[owner]", debloated, "unexpected file owner");
            }
        }

        if self.similarity == 0 {
            return ComparisonResult::success(self.id(), debloated);
        }

        let similarity = self.compare_files(original, &peer, &path).unwrap_or(0);
        if similarity < self.similarity {
            return ComparisonResult::error(
                self.id(),
                debloated,
                self.similarity_error(similarity),
            );
        }
        ComparisonResult::success(self.id(), debloated)
    }
}
