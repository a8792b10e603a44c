//! Build recipe parsing.
//!
//! A recipe is a KDL document, by default `layerkit.kdl` at the project root:
//!
//! ```kdl
//! project "mc-frontend"
//! manifest "Cargo.toml" lock="Cargo.lock"
//! source "src"
//! templates "templates"
//! assets "assets"
//!
//! toolchain {
//!     image "rust:1.85"
//!     dependency-build "cargo" "build" "--release" "--locked"
//!     build "cargo" "build" "--release" "--locked"
//! }
//!
//! runtime {
//!     base "debian:bookworm-slim"
//!     workdir "/app"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use layerkit_core::executor::VolumeMount;
use layerkit_core::pipeline::{
    BuildRecipe, ManifestSpec, PlaceholderSource, ProjectSpec, RuntimeSpec, ToolchainSpec,
    TrustStoreSpec,
};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

const DEFAULT_TRUST_STORE: &str = "/etc/ssl/certs/ca-certificates.crt";

/// Load a recipe file. Relative paths inside it resolve against the file's
/// directory.
pub fn load_recipe(path: &Path) -> ConfigResult<BuildRecipe> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parse_recipe(&content, &dir)
}

/// Parse a recipe from KDL text.
pub fn parse_recipe(kdl: &str, project_dir: &Path) -> ConfigResult<BuildRecipe> {
    let doc: KdlDocument = kdl.parse()?;

    let mut project: Option<(String, Option<String>)> = None;
    let mut manifest = ManifestSpec {
        manifest: PathBuf::from("Cargo.toml"),
        lock: PathBuf::from("Cargo.lock"),
    };
    let mut source_dir = PathBuf::from("src");
    let mut templates_dir = None;
    let mut assets_dir = None;
    let mut toolchain = default_toolchain();
    let mut runtime = default_runtime();

    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if project.is_some() {
                    return Err(ConfigError::Duplicate("project".to_string()));
                }
                let name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;
                project = Some((name, get_string_prop(node, "binary")));
            }
            "manifest" => {
                if let Some(file) = get_first_string_arg(node) {
                    manifest.manifest = PathBuf::from(file);
                }
                if let Some(lock) = get_string_prop(node, "lock") {
                    manifest.lock = PathBuf::from(lock);
                }
            }
            "source" => {
                source_dir = required_path(node, "source")?;
            }
            "templates" => {
                templates_dir = Some(required_path(node, "templates")?);
            }
            "assets" => {
                assets_dir = Some(required_path(node, "assets")?);
            }
            "toolchain" => parse_toolchain(node, &mut toolchain)?,
            "runtime" => parse_runtime(node, &mut runtime)?,
            _ => {} // Ignore unknown nodes
        }
    }

    let (name, binary) =
        project.ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;
    if name.trim().is_empty() {
        return Err(ConfigError::MissingField("project name".to_string()));
    }
    let binary = binary.unwrap_or_else(|| name.clone());
    validate_binary_name(&binary)?;

    if toolchain.dependency_build.is_empty() {
        return Err(ConfigError::MissingField(
            "toolchain dependency-build command".to_string(),
        ));
    }
    if toolchain.build.is_empty() {
        return Err(ConfigError::MissingField("toolchain build command".to_string()));
    }
    let mut confined = vec![
        ("manifest", manifest.manifest.as_path()),
        ("manifest lock", manifest.lock.as_path()),
        ("source", source_dir.as_path()),
        ("toolchain target", toolchain.target_dir.as_path()),
        ("toolchain output", toolchain.output_dir.as_path()),
        ("toolchain placeholder", toolchain.placeholder.path.as_path()),
    ];
    if let Some(templates) = &templates_dir {
        confined.push(("templates", templates.as_path()));
    }
    for (field, path) in confined {
        check_workspace_relative(field, path)?;
    }

    if !toolchain.output_dir.starts_with(&toolchain.target_dir) {
        return Err(ConfigError::InvalidValue {
            field: "toolchain output".to_string(),
            message: format!(
                "'{}' is not inside the target directory '{}'",
                toolchain.output_dir.display(),
                toolchain.target_dir.display()
            ),
        });
    }
    if !runtime.working_dir.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            field: "runtime workdir".to_string(),
            message: format!("'{}' must be an absolute path", runtime.working_dir),
        });
    }
    if !runtime.trust_store.path.starts_with('/') {
        return Err(ConfigError::InvalidValue {
            field: "runtime trust-store".to_string(),
            message: format!("'{}' must be an absolute path", runtime.trust_store.path),
        });
    }

    Ok(BuildRecipe {
        project: ProjectSpec {
            name,
            binary,
            dir: project_dir.to_path_buf(),
        },
        manifest,
        source_dir,
        templates_dir,
        assets_dir,
        toolchain,
        runtime,
    })
}

fn default_toolchain() -> ToolchainSpec {
    let cargo_release = vec![
        "cargo".to_string(),
        "build".to_string(),
        "--release".to_string(),
        "--locked".to_string(),
    ];
    ToolchainSpec {
        image: None,
        dependency_build: cargo_release.clone(),
        build: cargo_release,
        target_dir: PathBuf::from("target"),
        output_dir: PathBuf::from("target/release"),
        placeholder: PlaceholderSource::default(),
        env: BTreeMap::new(),
        timeout: None,
        volumes: Vec::new(),
    }
}

fn default_runtime() -> RuntimeSpec {
    RuntimeSpec {
        base: "debian:bookworm-slim".to_string(),
        working_dir: "/app".to_string(),
        trust_store: TrustStoreSpec {
            source: PathBuf::from(DEFAULT_TRUST_STORE),
            path: DEFAULT_TRUST_STORE.to_string(),
        },
    }
}

fn parse_toolchain(node: &KdlNode, toolchain: &mut ToolchainSpec) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "image" => {
                toolchain.image = get_first_string_arg(child);
            }
            "dependency-build" => {
                toolchain.dependency_build = get_all_string_args(child);
            }
            "build" => {
                toolchain.build = get_all_string_args(child);
            }
            "target" => {
                toolchain.target_dir = required_path(child, "toolchain target")?;
            }
            "output" => {
                toolchain.output_dir = required_path(child, "toolchain output")?;
            }
            "placeholder" => {
                let args = get_all_string_args(child);
                match args.as_slice() {
                    [path, contents] => {
                        toolchain.placeholder = PlaceholderSource {
                            path: PathBuf::from(path),
                            contents: contents.clone(),
                        };
                    }
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            field: "toolchain placeholder".to_string(),
                            message: "expected a path and its contents".to_string(),
                        });
                    }
                }
            }
            "timeout" => {
                let secs = get_first_integer_arg(child)
                    .filter(|s| *s > 0)
                    .ok_or_else(|| ConfigError::InvalidValue {
                        field: "toolchain timeout".to_string(),
                        message: "expected a positive number of seconds".to_string(),
                    })?;
                toolchain.timeout = Some(Duration::from_secs(secs as u64));
            }
            "volume" => {
                let args = get_all_string_args(child);
                match args.as_slice() {
                    [name, mount_path] => toolchain.volumes.push(VolumeMount {
                        name: name.clone(),
                        mount_path: mount_path.clone(),
                        read_only: false,
                    }),
                    _ => {
                        return Err(ConfigError::InvalidValue {
                            field: "toolchain volume".to_string(),
                            message: "expected a volume name and a mount path".to_string(),
                        });
                    }
                }
            }
            "env" => {
                if let Some(grandchildren) = child.children() {
                    for gc in grandchildren.nodes() {
                        let key = gc.name().value().to_string();
                        if let Some(val) = get_first_string_arg(gc) {
                            toolchain.env.insert(key, val);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn parse_runtime(node: &KdlNode, runtime: &mut RuntimeSpec) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        match child.name().value() {
            "base" => {
                if let Some(base) = get_first_string_arg(child) {
                    runtime.base = base;
                }
            }
            "workdir" => {
                if let Some(dir) = get_first_string_arg(child) {
                    runtime.working_dir = dir;
                }
            }
            "trust-store" => {
                if let Some(path) = get_first_string_arg(child) {
                    runtime.trust_store.source = PathBuf::from(&path);
                    runtime.trust_store.path = path;
                }
                if let Some(source) = get_string_prop(child, "source") {
                    runtime.trust_store.source = PathBuf::from(source);
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn validate_binary_name(binary: &str) -> ConfigResult<()> {
    let valid = !binary.is_empty()
        && binary != "."
        && binary != ".."
        && !binary.contains(['/', '\\'])
        && !binary.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: "project binary".to_string(),
            message: format!("'{}' is not a valid file name", binary),
        })
    }
}

/// Paths mirrored into the build workspace must stay inside it: relative,
/// without `..`, and naming something below the root.
fn check_workspace_relative(field: &str, path: &Path) -> ConfigResult<()> {
    let mut named = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {}
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!(
                        "'{}' must be a relative path inside the project",
                        path.display()
                    ),
                });
            }
        }
    }
    if named {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("'{}' does not name a file or directory", path.display()),
        })
    }
}

fn required_path(node: &KdlNode, field: &str) -> ConfigResult<PathBuf> {
    get_first_string_arg(node)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingField(format!("{} path", field)))
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_integer_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}
