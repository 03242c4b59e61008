use crate::error::SetupError;
use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

/// Finds the executables under test.
///
/// A binary named `name` is resolved by looking at, in order:
///
/// 1. The environment variable `<NAME>_BIN` (see [env_var_name]). If set, it must point at an
///    executable file.
/// 2. `<build_dir>/bin/<name>` and `<build_dir>/<name>`.
/// 3. Any file called `<name>` anywhere below `<build_dir>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLocator {
    build_dir: PathBuf,
}

impl BinaryLocator {
    /// Environment variable overriding the default build directory.
    pub const BUILD_DIR_VAR: &'static str = "HARNESS_BUILD_DIR";

    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
        }
    }

    /// Uses the directory named by `HARNESS_BUILD_DIR`, falling back to `./build`.
    pub fn from_env() -> Self {
        Self::new(env::var_os(Self::BUILD_DIR_VAR).unwrap_or_else(|| OsString::from("build")))
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn locate(&self, name: &str) -> Result<PathBuf, SetupError> {
        self.locate_with_override(name, env::var_os(env_var_name(name)))
    }

    fn locate_with_override(
        &self,
        name: &str,
        env_override: Option<OsString>,
    ) -> Result<PathBuf, SetupError> {
        if let Some(path) = env_override.filter(|path| !path.is_empty()) {
            let path = PathBuf::from(path);
            if !is_executable(&path) {
                return Err(SetupError::NotExecutable {
                    name: name.to_owned(),
                    path,
                });
            }
            tracing::debug!(name, path = %path.display(), "Using binary from environment");
            return Ok(path);
        }

        let direct = [
            self.build_dir.join("bin").join(name),
            self.build_dir.join(name),
        ];
        let found = direct
            .into_iter()
            .find(|candidate| is_executable(candidate))
            .or_else(|| find_below(&self.build_dir, name));

        match found {
            Some(path) => {
                tracing::debug!(name, path = %path.display(), "Located binary");
                Ok(path)
            }
            None => Err(SetupError::BinaryNotFound {
                name: name.to_owned(),
                build_dir: self.build_dir.clone(),
                env_var: env_var_name(name),
            }),
        }
    }
}

impl Default for BinaryLocator {
    fn default() -> Self {
        Self::from_env()
    }
}

/// The environment variable overriding the location of binary `name`, e.g. `CLIENT_1_BIN`.
pub fn env_var_name(name: &str) -> String {
    let mut var: String = name
        .chars()
        .map(|c| match c {
            c if c.is_ascii_alphanumeric() => c.to_ascii_uppercase(),
            _ => '_',
        })
        .collect();
    var.push_str("_BIN");
    var
}

fn find_below(dir: &Path, name: &str) -> Option<PathBuf> {
    // Unreadable directories are skipped.
    let entries = fs::read_dir(dir).ok()?;
    let mut sub_dirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            sub_dirs.push(path);
        } else if entry.file_name() == name && is_executable(&path) {
            return Some(path);
        }
    }
    sub_dirs.sort();
    sub_dirs
        .into_iter()
        .find_map(|sub_dir| find_below(&sub_dir, name))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
