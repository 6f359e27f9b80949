// cache.rs

use crate::error::{PipelineError, Result};
use crate::layout::ensure_parent;
use crate::matrix::DatasetTag;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

/// Bump when an artifact format or stage semantics change.
pub const CACHE_VERSION: &str = "2";

/// When an existing artifact may be reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Reuse only if the manifest matches the version and every upstream input.
    #[default]
    Fingerprint,
    /// Reuse whatever exists.
    ExistenceOnly,
}

impl FromStr for CachePolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fingerprint" => Ok(CachePolicy::Fingerprint),
            "existence" | "existence-only" => Ok(CachePolicy::ExistenceOnly),
            other => Err(PipelineError::UnsupportedKeyword {
                what: "cache policy",
                value: other.to_string(),
            }),
        }
    }
}

/// Identity of an input file at the time an artifact was built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub len: u64,
    #[serde(default)]
    pub modified_nanos: u64,
}

impl Fingerprint {
    pub fn of(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified_nanos = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            len: meta.len(),
            modified_nanos,
        })
    }
}

/// Settings other than input files that decide an artifact's contents,
/// such as the unencoded-genotype policy of a normalized cohort table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageParams(BTreeMap<String, String>);

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

/// Sidecar written next to every cached artifact.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub version: String,
    pub upstream: Vec<Fingerprint>,
    #[serde(default)]
    pub params: StageParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<DatasetTag>,
}

pub fn manifest_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".manifest.json");
    PathBuf::from(name)
}

#[derive(Clone, Debug)]
pub struct ArtifactCache {
    pub version: String,
    pub policy: CachePolicy,
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::new(CachePolicy::default())
    }
}

impl ArtifactCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            version: CACHE_VERSION.to_string(),
            policy,
        }
    }

    fn read_manifest(&self, artifact: &Path) -> Result<Option<ArtifactManifest>> {
        let path = manifest_path(artifact);
        if !path.exists() {
            return Ok(None);
        }
        let manifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        Ok(Some(manifest))
    }

    /// Whether `artifact` can be reused given the inputs and settings it is
    /// built from.
    pub fn is_fresh(&self, artifact: &Path, upstream: &[&Path], params: &StageParams) -> Result<bool> {
        if !artifact.exists() {
            return Ok(false);
        }
        if self.policy == CachePolicy::ExistenceOnly {
            warn!(
                "Reusing {} without checking its inputs; upstream changes are not detected.",
                artifact.display()
            );
            return Ok(true);
        }
        let manifest = match self.read_manifest(artifact) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => {
                debug!("{} has no manifest; rebuilding.", artifact.display());
                return Ok(false);
            }
            Err(PipelineError::Manifest(e)) => {
                warn!("Unreadable manifest for {} ({}); rebuilding.", artifact.display(), e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        if manifest.version != self.version {
            debug!(
                "{} was built by cache version {} (now {}); rebuilding.",
                artifact.display(),
                manifest.version,
                self.version
            );
            return Ok(false);
        }
        if manifest.params != *params {
            debug!(
                "{} was built with {:?}, now {:?}; rebuilding.",
                artifact.display(),
                manifest.params,
                params
            );
            return Ok(false);
        }
        if manifest.upstream.len() != upstream.len() {
            return Ok(false);
        }
        for (recorded, path) in manifest.upstream.iter().zip(upstream) {
            if !path.exists() || *recorded != Fingerprint::of(path)? {
                debug!("Input {} changed since {} was built.", path.display(), artifact.display());
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Drops the manifest of an artifact about to be rebuilt, so a build that
    /// fails halfway never leaves a fresh-looking artifact behind.
    pub fn invalidate(&self, artifact: &Path) -> Result<()> {
        let path = manifest_path(artifact);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Writes the manifest for a freshly written artifact.
    pub fn record(
        &self,
        artifact: &Path,
        upstream: &[&Path],
        params: &StageParams,
        tag: Option<DatasetTag>,
    ) -> Result<()> {
        let manifest = ArtifactManifest {
            version: self.version.clone(),
            upstream: upstream
                .iter()
                .map(|p| Fingerprint::of(p))
                .collect::<Result<_>>()?,
            params: params.clone(),
            tag,
        };
        let path = manifest_path(artifact);
        ensure_parent(&path)?;
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut writer, &manifest)?;
        writer.flush()?;
        Ok(())
    }

    /// The dataset tag stored with `artifact`, if any.
    pub fn load_tag(&self, artifact: &Path) -> Result<Option<DatasetTag>> {
        Ok(self.read_manifest(artifact)?.and_then(|m| m.tag))
    }
}
