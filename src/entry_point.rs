//! Python entry points: `path.to.module` or `path.to.module:func`.
//!
//! A `pex_binary` may also name its entry point by file (`app.py`,
//! `app.py:main`), which is resolved against the target's directory and the
//! repository's source roots. A distribution's `entry_points` may reference
//! such a binary by address instead of spelling the module out.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use fs::{FsError, RelativePath};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Entry-point values meaning "no entry point".
const NONE_VALUES: [&str; 2] = ["<none>", "<None>"];

/// Categories whose entries become executables and so need a function.
const SCRIPT_CATEGORIES: [&str; 2] = ["console_scripts", "gui_scripts"];

#[derive(Debug, Error)]
pub enum EntryPointError {
    #[error(
        "the entry point{} cannot be blank; use `path.to.module` or `path.to.module:my_func`",
        provenance_suffix(provenance.as_deref())
    )]
    Blank { provenance: Option<String> },

    #[error(
        "invalid entry point {value:?}{}: {reason}; use `path.to.module` or `path.to.module:my_func`",
        provenance_suffix(provenance.as_deref())
    )]
    Malformed {
        value: String,
        provenance: Option<String>,
        reason: &'static str,
    },

    #[error("no file matched the entry point {spec:?} for {origin}")]
    NoMatch { spec: String, origin: String },

    #[error(
        "multiple files matched the entry point {spec:?} for {origin}, but only one file \
         expected; are you using a glob rather than a file name? all matching files: {matches:?}"
    )]
    MultipleMatches {
        spec: String,
        origin: String,
        matches: Vec<String>,
    },

    #[error("{} is not under any source root", path.display())]
    NoSourceRoot { path: std::path::PathBuf },

    #[error(
        "all target addresses in the entry_points field must be for pex_binary targets, but \
         {owner} includes {reference}; alternatively, use a module like \"project.app:main\""
    )]
    NotAPexBinary { owner: String, reference: String },

    #[error(
        "every entry point in `{category}` for {owner} must end in the format `:my_func`, but \
         {name} set it to {spec:?}; for example, set \
         `entry_points={{\"{category}\": {{\"{name}\": \"{module}:main\"}}}}`"
    )]
    InvalidEntryPoint {
        category: String,
        owner: String,
        name: String,
        spec: String,
        module: String,
    },

    #[error(transparent)]
    Fs(#[from] FsError),
}

fn provenance_suffix(provenance: Option<&str>) -> String {
    provenance.map_or_else(String::new, |p| format!(" provided by {p}"))
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryPoint {
    pub module: String,
    pub function: Option<String>,
}

impl EntryPoint {
    /// Parse `module` or `module:function`.
    ///
    /// # Errors
    /// Returns [`EntryPointError::Blank`] for an empty value and
    /// [`EntryPointError::Malformed`] for empty parts, whitespace, or extra
    /// colons.
    pub fn parse(value: &str, provenance: Option<&str>) -> Result<Self, EntryPointError> {
        let malformed = |reason| EntryPointError::Malformed {
            value: value.to_owned(),
            provenance: provenance.map(str::to_owned),
            reason,
        };
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(EntryPointError::Blank {
                provenance: provenance.map(str::to_owned),
            });
        }
        let (module, function) = match trimmed.split_once(':') {
            None => (trimmed, None),
            Some((module, function)) => {
                if function.contains(':') {
                    return Err(malformed("it contains more than one `:`"));
                }
                (module, Some(function))
            }
        };
        if module.is_empty() {
            return Err(malformed("the module is empty"));
        }
        if module.contains(char::is_whitespace) {
            return Err(malformed("the module contains whitespace"));
        }
        if let Some(function) = function {
            if function.is_empty() {
                return Err(malformed("the function after `:` is empty"));
            }
            if function.contains(char::is_whitespace) {
                return Err(malformed("the function contains whitespace"));
            }
        }
        Ok(Self {
            module: module.to_owned(),
            function: function.map(str::to_owned),
        })
    }

    #[must_use]
    pub fn spec(&self) -> String {
        self.to_string()
    }

    fn is_none_value(&self) -> bool {
        NONE_VALUES.contains(&self.module.as_str())
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(function) => write!(f, "{}:{function}", self.module),
            None => f.write_str(&self.module),
        }
    }
}

/// The result of resolving a `pex_binary` entry point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedPexEntryPoint {
    /// `None` when the binary opted out with `<none>`.
    pub entry_point: Option<EntryPoint>,
    /// Whether the module was derived from a file name, in which case the
    /// module's owner must live at or above the binary's directory.
    pub file_name_used: bool,
}

/// Resolve a `pex_binary` entry point.
///
/// `spec_path` is the directory of the owning target, relative to
/// `build_root`. A module ending in `.py` is globbed there; exactly one file
/// must match. The longest of `source_roots` containing the match is
/// stripped and the remainder becomes a dotted module name.
///
/// # Errors
/// Returns [`EntryPointError::NoMatch`], [`EntryPointError::MultipleMatches`]
/// or [`EntryPointError::NoSourceRoot`], and [`EntryPointError::Fs`] for
/// invalid globs.
pub fn resolve_pex_entry_point(
    entry_point: &EntryPoint,
    spec_path: &RelativePath,
    build_root: &Path,
    source_roots: &[RelativePath],
    origin: &str,
) -> Result<ResolvedPexEntryPoint, EntryPointError> {
    if entry_point.is_none_value() {
        return Ok(ResolvedPexEntryPoint {
            entry_point: None,
            file_name_used: false,
        });
    }
    if !has_py_suffix(&entry_point.module) {
        return Ok(ResolvedPexEntryPoint {
            entry_point: Some(entry_point.clone()),
            file_name_used: false,
        });
    }

    let pattern = spec_path.as_path().join(&entry_point.module);
    let matches = fs::expand_globs(build_root, &[pattern.to_string_lossy().into_owned()])?;
    let file = match matches.as_slice() {
        [] => {
            return Err(EntryPointError::NoMatch {
                spec: entry_point.spec(),
                origin: origin.to_owned(),
            });
        }
        [file] => file,
        many => {
            return Err(EntryPointError::MultipleMatches {
                spec: entry_point.spec(),
                origin: origin.to_owned(),
                matches: many
                    .iter()
                    .map(|m| m.as_path().display().to_string())
                    .collect(),
            });
        }
    };

    let root = source_root_for(file, source_roots).ok_or_else(|| EntryPointError::NoSourceRoot {
        path: file.as_path().to_owned(),
    })?;
    let stripped = file
        .as_path()
        .strip_prefix(root.as_path())
        .map_err(|_| EntryPointError::NoSourceRoot {
            path: file.as_path().to_owned(),
        })?;
    let module = RelativePath::new(stripped.with_extension(""))?
        .components()
        .join(".");
    tracing::debug!(%origin, file = %file.as_path().display(), %module, "resolved entry point file");
    Ok(ResolvedPexEntryPoint {
        entry_point: Some(EntryPoint {
            module,
            function: entry_point.function.clone(),
        }),
        file_name_used: true,
    })
}

fn has_py_suffix(module: &str) -> bool {
    Path::new(module)
        .extension()
        .is_some_and(|ext| ext == "py")
}

/// The deepest source root that contains `file`. The empty path is the build
/// root itself.
fn source_root_for<'a>(file: &RelativePath, source_roots: &'a [RelativePath]) -> Option<&'a RelativePath> {
    source_roots
        .iter()
        .filter(|root| file.as_path().starts_with(root.as_path()))
        .max_by_key(|root| root.components().len())
}

/// One value from a distribution's `entry_points` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassifiedEntryPoint {
    /// The value is a target address (`:bin` or `path/to:bin`) rather than a
    /// module.
    pub is_target: bool,
    pub category: String,
    pub name: String,
    pub value: String,
}

/// `category → name → value`, as written in a `python_distribution`.
pub type EntryPointsField = BTreeMap<String, BTreeMap<String, String>>;

#[must_use]
pub fn classify_entry_points(field: &EntryPointsField) -> Vec<ClassifiedEntryPoint> {
    field
        .iter()
        .flat_map(|(category, entries)| {
            entries.iter().map(move |(name, value)| ClassifiedEntryPoint {
                is_target: value.starts_with(':') || value.contains('/'),
                category: category.clone(),
                name: name.clone(),
                value: value.clone(),
            })
        })
        .collect()
}

/// A resolved distribution entry point, remembering the `pex_binary` it came
/// from if any.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DistributionEntryPoint {
    pub entry_point: EntryPoint,
    pub owner: Option<String>,
}

pub type ResolvedDistributionEntryPoints = BTreeMap<String, BTreeMap<String, DistributionEntryPoint>>;

/// Resolve every entry in a distribution's `entry_points` field.
///
/// Target references go through `resolve_target`, which returns the
/// referenced `pex_binary`'s resolved entry point. References to binaries
/// with no entry point are skipped with a warning.
///
/// # Errors
/// Propagates parse and resolver errors, and returns
/// [`EntryPointError::InvalidEntryPoint`] for script entries without a
/// function.
pub fn resolve_distribution_entry_points<F>(
    field: &EntryPointsField,
    owner: &str,
    mut resolve_target: F,
) -> Result<ResolvedDistributionEntryPoints, EntryPointError>
where
    F: FnMut(&str) -> Result<ResolvedPexEntryPoint, EntryPointError>,
{
    let mut resolved = ResolvedDistributionEntryPoints::new();
    for classified in classify_entry_points(field) {
        let ClassifiedEntryPoint {
            is_target,
            category,
            name,
            value,
        } = classified;
        let (entry_point, binary) = if is_target {
            let Some(entry_point) = resolve_target(&value)?.entry_point else {
                tracing::warn!(
                    %name,
                    %category,
                    reference = %value,
                    "skipping entry point: the referenced pex binary sets its entry point to '<none>'"
                );
                continue;
            };
            (entry_point, Some(value))
        } else {
            let provenance = format!("{name} for {owner} {category}");
            (EntryPoint::parse(&value, Some(&provenance))?, None)
        };

        if SCRIPT_CATEGORIES.contains(&category.as_str()) && entry_point.function.is_none() {
            return Err(EntryPointError::InvalidEntryPoint {
                spec: entry_point.spec(),
                module: entry_point.module,
                category,
                owner: owner.to_owned(),
                name,
            });
        }

        resolved.entry(category).or_default().insert(
            name,
            DistributionEntryPoint {
                entry_point,
                owner: binary,
            },
        );
    }
    Ok(resolved)
}
