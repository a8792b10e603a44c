//! Manifest pair loading and validation.
//!
//! The manifest pair is a `Cargo.toml` and its resolved `Cargo.lock`. Before
//! any compilation, the pair must parse and agree with itself: the lock must
//! contain the manifest's package, that package's lock entry must list every
//! declared dependency with a locked version that satisfies its requirement,
//! and every dependency reference inside the lock must resolve to a locked
//! package.

use crate::{ConfigError, ConfigResult};
use layerkit_core::ContentDigest;
use semver::{Version, VersionReq};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use toml::{Table, Value};
use tracing::debug;

const DEPENDENCY_TABLES: [(&str, DependencyKind); 3] = [
    ("dependencies", DependencyKind::Normal),
    ("build-dependencies", DependencyKind::Build),
    ("dev-dependencies", DependencyKind::Dev),
];

/// A validated manifest pair.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestPair {
    /// Raw manifest text.
    pub manifest: String,
    /// Raw lock file text.
    pub lock: String,
    /// Root package name.
    pub package: String,
    /// Root package version, when the manifest states it literally.
    pub version: Option<String>,
    /// Every dependency the manifest declares.
    pub dependencies: Vec<DeclaredDependency>,
    /// Number of packages in the lock file.
    pub locked_packages: usize,
    /// Digest over both files; the dependency layer's cache key input.
    pub digest: ContentDigest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredDependency {
    /// Key used in the manifest.
    pub alias: String,
    /// Package name, after `package = "..."` renames.
    pub package: String,
    /// Version requirement, absent for path, git and workspace-inherited
    /// dependencies.
    pub requirement: Option<String>,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DependencyKind {
    Normal,
    Build,
    Dev,
}

#[derive(Debug)]
struct LockedPackage {
    name: String,
    version: String,
    dependencies: Vec<String>,
}

/// Read and validate a manifest pair from disk.
pub fn load_manifest_pair(manifest_path: &Path, lock_path: &Path) -> ConfigResult<ManifestPair> {
    let read = |path: &Path| {
        std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    };
    let manifest = read(manifest_path)?;
    let lock = read(lock_path)?;
    validate_manifest_pair(manifest, lock)
}

/// Validate a manifest pair given as text.
pub fn validate_manifest_pair(manifest: String, lock: String) -> ConfigResult<ManifestPair> {
    let manifest_table = parse_toml("manifest", &manifest)?;
    let lock_table = parse_toml("lock file", &lock)?;

    let package_table = manifest_table
        .get("package")
        .and_then(Value::as_table)
        .ok_or_else(|| ConfigError::MissingField("[package] in manifest".to_string()))?;
    let package = package_table
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::MissingField("package.name in manifest".to_string()))?
        .to_string();
    // `version.workspace = true` is inherited and can't be checked here.
    let version = package_table
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string);

    let dependencies = declared_dependencies(&manifest_table)?;
    let locked = locked_packages(&lock_table)?;

    let root = locked
        .iter()
        .find(|p| p.name == package && version.as_ref().is_none_or(|v| *v == p.version))
        .ok_or_else(|| {
            ConfigError::Inconsistent(format!(
                "lock file has no entry for package '{}'{}",
                package,
                version
                    .as_ref()
                    .map(|v| format!(" {}", v))
                    .unwrap_or_default()
            ))
        })?;

    let root_deps: BTreeSet<&str> = root
        .dependencies
        .iter()
        .map(|d| dependency_name(d))
        .collect();
    for dep in &dependencies {
        if !root_deps.contains(dep.package.as_str()) {
            return Err(ConfigError::Inconsistent(format!(
                "dependency '{}' is declared in the manifest but not locked for '{}'",
                dep.package, package
            )));
        }
        check_requirement(dep, &root.dependencies, &locked)?;
    }

    for pkg in &locked {
        for reference in &pkg.dependencies {
            if !reference_resolves(reference, &locked) {
                return Err(ConfigError::Inconsistent(format!(
                    "locked package '{} {}' depends on '{}', which is not in the lock file",
                    pkg.name, pkg.version, reference
                )));
            }
        }
    }

    let digest = ContentDigest::builder()
        .part("manifest", manifest.as_bytes())
        .part("lock", lock.as_bytes())
        .finish();

    debug!(
        package = %package,
        dependencies = dependencies.len(),
        locked = locked.len(),
        digest = %digest.short(),
        "Validated manifest pair"
    );

    Ok(ManifestPair {
        manifest,
        lock,
        package,
        version,
        dependencies,
        locked_packages: locked.len(),
        digest,
    })
}

fn parse_toml(file: &str, text: &str) -> ConfigResult<Table> {
    toml::from_str(text).map_err(|source| ConfigError::Toml {
        file: file.to_string(),
        source,
    })
}

fn declared_dependencies(manifest: &Table) -> ConfigResult<Vec<DeclaredDependency>> {
    let mut declared = Vec::new();
    collect_dependency_tables(manifest, &mut declared)?;

    // [target.'cfg(...)'.dependencies] and friends
    if let Some(targets) = manifest.get("target").and_then(Value::as_table) {
        for target in targets.values() {
            if let Some(target) = target.as_table() {
                collect_dependency_tables(target, &mut declared)?;
            }
        }
    }

    Ok(declared)
}

fn collect_dependency_tables(
    table: &Table,
    declared: &mut Vec<DeclaredDependency>,
) -> ConfigResult<()> {
    for (section, kind) in DEPENDENCY_TABLES {
        let Some(deps) = table.get(section) else {
            continue;
        };
        let deps = deps.as_table().ok_or_else(|| ConfigError::InvalidValue {
            field: section.to_string(),
            message: "expected a table".to_string(),
        })?;
        for (alias, spec) in deps {
            let (package, requirement) = match spec {
                Value::String(req) => (alias.clone(), Some(req.clone())),
                Value::Table(t) => (
                    t.get("package")
                        .and_then(Value::as_str)
                        .unwrap_or(alias.as_str())
                        .to_string(),
                    t.get("version").and_then(Value::as_str).map(str::to_string),
                ),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("{}.{}", section, alias),
                        message: "expected a version string or a table".to_string(),
                    });
                }
            };
            declared.push(DeclaredDependency {
                alias: alias.clone(),
                package,
                requirement,
                kind,
            });
        }
    }
    Ok(())
}

fn locked_packages(lock: &Table) -> ConfigResult<Vec<LockedPackage>> {
    let packages = lock
        .get("package")
        .and_then(Value::as_array)
        .ok_or_else(|| ConfigError::MissingField("[[package]] in lock file".to_string()))?;

    packages
        .iter()
        .enumerate()
        .map(|(idx, entry)| -> ConfigResult<LockedPackage> {
            let entry = entry.as_table().ok_or_else(|| ConfigError::InvalidValue {
                field: format!("lock package #{}", idx),
                message: "expected a table".to_string(),
            })?;
            let field = |name: &str| {
                entry
                    .get(name)
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ConfigError::MissingField(format!("{} of lock package #{}", name, idx))
                    })
            };
            let dependencies = entry
                .get("dependencies")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(LockedPackage {
                name: field("name")?,
                version: field("version")?,
                dependencies,
            })
        })
        .collect()
}

/// Lock references are `name`, `name version` or `name version (source)`.
fn dependency_name(reference: &str) -> &str {
    reference.split_whitespace().next().unwrap_or(reference)
}

/// The root package's lock entry must pin a version of `dep` that its
/// manifest requirement accepts.
fn check_requirement(
    dep: &DeclaredDependency,
    root_references: &[String],
    locked: &[LockedPackage],
) -> ConfigResult<()> {
    let Some(requirement) = &dep.requirement else {
        return Ok(());
    };
    let req = VersionReq::parse(requirement).map_err(|e| ConfigError::InvalidValue {
        field: format!("dependency '{}'", dep.alias),
        message: format!("'{}' is not a version requirement: {}", requirement, e),
    })?;

    let mut candidates = Vec::new();
    for reference in root_references {
        let mut parts = reference.split_whitespace();
        if parts.next() != Some(dep.package.as_str()) {
            continue;
        }
        match parts.next() {
            Some(version) => candidates.push(version),
            None => candidates.extend(
                locked
                    .iter()
                    .filter(|p| p.name == dep.package)
                    .map(|p| p.version.as_str()),
            ),
        }
    }

    let satisfied = candidates
        .iter()
        .filter_map(|v| Version::parse(v).ok())
        .any(|v| req.matches(&v));
    if satisfied {
        Ok(())
    } else {
        Err(ConfigError::Inconsistent(format!(
            "dependency '{}' requires {} but the lock file pins {}",
            dep.package,
            requirement,
            candidates.join(", ")
        )))
    }
}

fn reference_resolves(reference: &str, locked: &[LockedPackage]) -> bool {
    let mut parts = reference.split_whitespace();
    let name = parts.next().unwrap_or(reference);
    let version = parts.next();
    locked
        .iter()
        .any(|p| p.name == name && version.is_none_or(|v| v == p.version))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[package]
name = "mc-frontend"
version = "0.1.0"
edition = "2024"

[dependencies]
lib = "1.0"
json = { version = "1", package = "serde_json" }

[build-dependencies]
gen = "0.3"
"#;

    const LOCK: &str = r#"
version = 4

[[package]]
name = "gen"
version = "0.3.2"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "lib"
version = "1.0.4"
source = "registry+https://github.com/rust-lang/crates.io-index"

[[package]]
name = "mc-frontend"
version = "0.1.0"
dependencies = [
 "gen",
 "lib",
 "serde_json",
]

[[package]]
name = "serde_json"
version = "1.0.140"
source = "registry+https://github.com/rust-lang/crates.io-index"
dependencies = [
 "lib 1.0.4",
]
"#;

    #[test]
    fn test_valid_pair() {
        let pair = validate_manifest_pair(MANIFEST.to_string(), LOCK.to_string()).unwrap();
        assert_eq!(pair.package, "mc-frontend");
        assert_eq!(pair.version.as_deref(), Some("0.1.0"));
        assert_eq!(pair.dependencies.len(), 3);
        assert_eq!(pair.locked_packages, 4);
        let renamed = pair
            .dependencies
            .iter()
            .find(|d| d.alias == "json")
            .unwrap();
        assert_eq!(renamed.package, "serde_json");
        assert_eq!(
            pair.dependencies
                .iter()
                .find(|d| d.alias == "gen")
                .unwrap()
                .kind,
            DependencyKind::Build
        );
    }

    #[test]
    fn test_digest_tracks_both_files() {
        let a = validate_manifest_pair(MANIFEST.to_string(), LOCK.to_string()).unwrap();
        let b = validate_manifest_pair(MANIFEST.to_string(), LOCK.to_string()).unwrap();
        assert_eq!(a.digest, b.digest);

        let bumped = MANIFEST.replace("lib = \"1.0\"", "lib = \"1.0.2\"");
        let c = validate_manifest_pair(bumped, LOCK.to_string()).unwrap();
        assert_ne!(a.digest, c.digest);

        let relocked = LOCK.replace("serde_json\"\nversion = \"1.0.140\"", "serde_json\"\nversion = \"1.0.141\"");
        let d = validate_manifest_pair(MANIFEST.to_string(), relocked).unwrap();
        assert_ne!(a.digest, d.digest);
    }

    #[test]
    fn test_requirement_bump_without_relock() {
        let bumped = MANIFEST.replace("lib = \"1.0\"", "lib = \"1.1\"");
        let err = validate_manifest_pair(bumped, LOCK.to_string()).unwrap_err();
        match err {
            ConfigError::Inconsistent(msg) => {
                assert!(msg.contains("lib"));
                assert!(msg.contains("1.0.4"));
            }
            other => panic!("expected Inconsistent, got {:?}", other),
        }

        let relocked = LOCK.replace("version = \"1.0.4\"", "version = \"1.1.0\"")
            .replace("\"lib 1.0.4\"", "\"lib 1.1.0\"");
        let bumped = MANIFEST.replace("lib = \"1.0\"", "lib = \"1.1\"");
        assert!(validate_manifest_pair(bumped, relocked).is_ok());
    }

    #[test]
    fn test_requirement_of_renamed_table_dependency() {
        let manifest = MANIFEST.replace(
            "{ version = \"1\", package = \"serde_json\" }",
            "{ version = \"2\", package = \"serde_json\" }",
        );
        let err = validate_manifest_pair(manifest, LOCK.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(msg) if msg.contains("serde_json")));
    }

    #[test]
    fn test_path_dependency_has_no_requirement() {
        let manifest = MANIFEST.replace("lib = \"1.0\"", "lib = { path = \"../lib\" }");
        let pair = validate_manifest_pair(manifest, LOCK.to_string()).unwrap();
        let lib = pair.dependencies.iter().find(|d| d.alias == "lib").unwrap();
        assert_eq!(lib.requirement, None);
    }

    #[test]
    fn test_unparseable_requirement() {
        let manifest = MANIFEST.replace("lib = \"1.0\"", "lib = \"one point oh\"");
        let err = validate_manifest_pair(manifest, LOCK.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_malformed_manifest() {
        let err = validate_manifest_pair("[package\nname=".to_string(), LOCK.to_string())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn test_manifest_without_package() {
        let err = validate_manifest_pair("[dependencies]\n".to_string(), LOCK.to_string())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));
    }

    #[test]
    fn test_undeclared_lock_entry_for_new_dependency() {
        let manifest = format!("{}extra = \"2\"\n", MANIFEST.replace("[build-dependencies]\ngen = \"0.3\"\n", ""));
        let err = validate_manifest_pair(manifest, LOCK.to_string()).unwrap_err();
        match err {
            ConfigError::Inconsistent(msg) => assert!(msg.contains("extra")),
            other => panic!("expected Inconsistent, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_for_another_package() {
        let manifest = MANIFEST.replace("name = \"mc-frontend\"", "name = \"other\"");
        let err = validate_manifest_pair(manifest, LOCK.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_root_version_mismatch() {
        let manifest = MANIFEST.replace("version = \"0.1.0\"", "version = \"0.2.0\"");
        let err = validate_manifest_pair(manifest, LOCK.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_dangling_lock_reference() {
        let lock = LOCK.replace("\"lib 1.0.4\"", "\"lib 9.9.9\"");
        let err = validate_manifest_pair(MANIFEST.to_string(), lock).unwrap_err();
        match err {
            ConfigError::Inconsistent(msg) => assert!(msg.contains("lib 9.9.9")),
            other => panic!("expected Inconsistent, got {:?}", other),
        }
    }

    #[test]
    fn test_target_specific_dependencies_are_checked() {
        let manifest = format!(
            "{}\n[target.'cfg(unix)'.dependencies]\nnix = \"0.30\"\n",
            MANIFEST
        );
        let err = validate_manifest_pair(manifest, LOCK.to_string()).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn test_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_manifest_pair(&dir.path().join("Cargo.toml"), &dir.path().join("Cargo.lock"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
