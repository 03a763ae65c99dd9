// src/drivers/pip/metadata.rs

//! Name and version of a Python package
//!
//! `setup.py` is never executed. A small literal evaluator finds the
//! `setup(...)` call and accepts `name=`/`version=` arguments that are
//! literals, or a single top-level variable assigned a literal before the
//! call. Whatever it cannot resolve is filled in from `setup.cfg`
//! `[metadata]`, whose `file:` and `attr:` version directives are
//! supported to the same literal-only extent.

use ini::Ini;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::paths::lexical_join;

static SETUP_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*(?:setuptools\.)?setup[ \t]*\(").expect("valid regex")
});

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)[ \t]*=[ \t]*([^=].*)$").expect("valid regex")
});

static MODULE_PART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

static NAME_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_.]+").expect("valid regex"));

/// Canonical form of a Python project name
pub fn canonicalize_name(name: &str) -> String {
    NAME_SEPARATORS
        .replace_all(&name.to_lowercase(), "-")
        .into_owned()
}

/// Name and version found in a setup file, either may be missing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetupMetadata {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Name and version of the package at `package_dir`
pub fn package_metadata(package_dir: &Path) -> Result<(String, String)> {
    let mut metadata = SetupMetadata::default();

    let setup_py = package_dir.join("setup.py");
    if setup_py.is_file() {
        info!("Extracting metadata from setup.py");
        metadata = evaluate_setup_py(&std::fs::read_to_string(&setup_py)?);
    } else {
        warn!("No setup.py in {}, the package is likely not pip compatible", package_dir.display());
    }

    if (metadata.name.is_none() || metadata.version.is_none())
        && package_dir.join("setup.cfg").is_file()
    {
        info!("Filling in missing metadata from setup.cfg");
        let cfg = read_setup_cfg(package_dir)?;
        metadata.name = metadata.name.or(cfg.name);
        metadata.version = metadata.version.or(cfg.version);
    }

    match (metadata.name, metadata.version) {
        (Some(name), Some(version)) => {
            info!("Resolved package metadata: {} {}", name, version);
            Ok((name, version))
        }
        (name, version) => {
            let missing: Vec<&str> = [("name", name.is_none()), ("version", version.is_none())]
                .into_iter()
                .filter_map(|(field, absent)| absent.then_some(field))
                .collect();
            Err(Error::ValidationError(format!(
                "Could not resolve package metadata: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Evaluate the literal `name` and `version` arguments of a `setup()` call
pub fn evaluate_setup_py(source: &str) -> SetupMetadata {
    let Some(call) = SETUP_CALL.find(source) else {
        warn!("No setup() call found in setup.py");
        return SetupMetadata::default();
    };
    let Some(args) = balanced_arguments(&source[call.end()..]) else {
        warn!("Unterminated setup() call in setup.py");
        return SetupMetadata::default();
    };
    let before_call = &source[..call.start()];

    let mut metadata = SetupMetadata::default();
    for arg in split_top_level(args, ',') {
        let Some((key, value)) = arg.split_once('=') else {
            continue;
        };
        let slot = match key.trim() {
            "name" => &mut metadata.name,
            "version" => &mut metadata.version,
            _ => continue,
        };
        let value = value.trim();
        *slot = match eval_literal(value) {
            Some(v) => Some(v),
            None if MODULE_PART.is_match(value) => {
                let resolved = top_level_attr(before_call, value);
                if resolved.is_none() {
                    debug!("{} is not assigned a literal before setup()", value);
                }
                resolved
            }
            None => {
                debug!("setup() argument {} is not a literal", key.trim());
                None
            }
        };
    }
    metadata.name = metadata.name.filter(|n| !n.is_empty());
    metadata.version = metadata.version.filter(|v| !v.is_empty());
    metadata
}

/// `[metadata] name` and `version` from setup.cfg
pub fn read_setup_cfg(package_dir: &Path) -> Result<SetupMetadata> {
    let path = package_dir.join("setup.cfg");
    let ini = match Ini::load_from_file(&path) {
        Ok(ini) => ini,
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            return Ok(SetupMetadata::default());
        }
    };
    let option = |section: &str, key: &str| {
        ini.section(Some(section))
            .and_then(|s| s.get(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let name = option("metadata", "name");
    let version = match option("metadata", "version") {
        Some(raw) => {
            let package_dirs = parse_package_dirs(option("options", "package_dir").as_deref());
            resolve_cfg_version(package_dir, &raw, &package_dirs)?
        }
        None => None,
    };
    Ok(SetupMetadata { name, version })
}

fn resolve_cfg_version(
    package_dir: &Path,
    raw: &str,
    package_dirs: &HashMap<String, String>,
) -> Result<Option<String>> {
    if let Some(file) = raw.strip_prefix("file:") {
        let path = ensure_local(package_dir, Path::new(file.trim()))?;
        if !path.is_file() {
            warn!("Version file {} does not exist", path.display());
            return Ok(None);
        }
        let version = std::fs::read_to_string(&path)?.trim().to_string();
        return Ok(Some(version).filter(|v| !v.is_empty()));
    }

    if let Some(spec) = raw.strip_prefix("attr:") {
        let spec = spec.trim();
        let (module, attr) = match spec.rsplit_once('.') {
            Some((module, attr)) if !module.is_empty() => (module, attr),
            _ => ("__init__", spec.trim_start_matches('.')),
        };
        let Some(file) = find_module(package_dir, module, package_dirs)? else {
            warn!("Module {} not found", module);
            return Ok(None);
        };
        let source = std::fs::read_to_string(&file)?;
        return Ok(top_level_attr(&source, attr));
    }

    Ok(Some(raw.to_string()))
}

/// `options.package_dir`, either comma- or newline-separated `pkg = dir` items
fn parse_package_dirs(value: Option<&str>) -> HashMap<String, String> {
    let Some(value) = value else {
        return HashMap::new();
    };
    let items: Vec<&str> = if value.contains('\n') {
        value.lines().collect()
    } else {
        value.split(',').collect()
    };
    items
        .into_iter()
        .filter_map(|item| item.split_once('='))
        .map(|(pkg, dir)| (pkg.trim().to_string(), dir.trim().to_string()))
        .collect()
}

fn find_module(
    package_dir: &Path,
    module: &str,
    package_dirs: &HashMap<String, String>,
) -> Result<Option<PathBuf>> {
    let mut parts: Vec<&str> = module.split('.').collect();
    if parts.first() == Some(&"") {
        parts.remove(0);
    }
    if parts.is_empty() || !parts.iter().all(|p| MODULE_PART.is_match(p)) {
        return Err(Error::ValidationError(format!(
            "{module:?} is not an accepted module name"
        )));
    }

    let mut relative = PathBuf::new();
    if let Some(custom) = package_dirs.get(parts[0]) {
        relative.push(custom);
        relative.extend(&parts[1..]);
    } else {
        if let Some(root) = package_dirs.get("") {
            relative.push(root);
        }
        relative.extend(&parts);
    }

    let full = ensure_local(package_dir, &relative)?;
    let init = full.join("__init__.py");
    if init.is_file() {
        return Ok(Some(init));
    }
    let module_file = full.with_extension("py");
    Ok(module_file.is_file().then_some(module_file))
}

fn ensure_local(package_dir: &Path, path: &Path) -> Result<PathBuf> {
    lexical_join(package_dir, path)
        .filter(|p| p.starts_with(package_dir) && !path.is_absolute())
        .ok_or_else(|| {
            Error::ValidationError(format!(
                "{} is not a subpath of {}",
                path.display(),
                package_dir.display()
            ))
        })
}

/// Value of the last top-level literal assignment to `name`
fn top_level_attr(source: &str, name: &str) -> Option<String> {
    source
        .lines()
        .filter(|line| !line.starts_with([' ', '\t']))
        .filter_map(|line| ASSIGNMENT.captures(line))
        .filter(|caps| &caps[1] == name)
        .last()
        .and_then(|caps| eval_literal(strip_comment(&caps[2])))
}

fn strip_comment(value: &str) -> &str {
    let mut quote = None;
    for (i, c) in value.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, '#') => return value[..i].trim(),
            _ => {}
        }
    }
    value.trim()
}

/// A string, number, or tuple/list of those, rendered as a version string
fn eval_literal(expr: &str) -> Option<String> {
    let expr = expr.trim();
    if let Some(inner) = expr
        .strip_prefix('(')
        .and_then(|e| e.strip_suffix(')'))
        .or_else(|| expr.strip_prefix('[').and_then(|e| e.strip_suffix(']')))
    {
        let parts: Option<Vec<String>> = split_top_level(inner, ',')
            .into_iter()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(eval_literal)
            .collect();
        return parts.map(|p| p.join("."));
    }
    if let Some(s) = string_literal(expr) {
        return Some(s);
    }
    let is_number = !expr.is_empty()
        && expr.chars().all(|c| c.is_ascii_digit() || c == '.')
        && expr.starts_with(|c: char| c.is_ascii_digit());
    is_number.then(|| expr.to_string())
}

fn string_literal(expr: &str) -> Option<String> {
    let body = expr.trim_start_matches(['r', 'R', 'u', 'U']);
    let raw = body.len() != expr.len() && expr.to_lowercase().starts_with('r');
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = body.strip_prefix(quote).and_then(|b| b.strip_suffix(quote)) {
            if inner.contains(quote) && quote.len() == 1 {
                return None;
            }
            return Some(if raw {
                inner.to_string()
            } else {
                inner.replace("\\'", "'").replace("\\\"", "\"")
            });
        }
    }
    None
}

/// Text between the already-consumed `(` and its matching `)`
fn balanced_arguments(rest: &str) -> Option<&str> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if let Some(q) = quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                _ if c == q => quote = None,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&rest[..i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `sep` outside brackets and string literals
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                _ if c == q => quote = None,
                _ => {}
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}
