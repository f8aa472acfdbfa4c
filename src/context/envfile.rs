// Envfile Rules
// Declarative description of the env file generated for container runtimes:
// include/exclude globs, name sanitization, case transforms and quoting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use globset::Glob;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Case transform applied to matching keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifyOperation {
    Lower,
    Upper,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyEnv {
    pub pattern: String,
    pub operation: ModifyOperation,
}

/// Env file descriptor attached to an execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Envfile {
    /// Generate an env file for container runtimes (`docker`/`podman`).
    pub generate: bool,
    /// Keys matching any of these globs are dropped.
    pub exclude: Vec<String>,
    /// When non-empty, only keys matching one of these globs are kept.
    pub include: Vec<String>,
    pub modify: Vec<ModifyEnv>,
    /// Wrap values in double quotes.
    pub quote: bool,
    /// Replacement for characters not valid in env var names.
    pub replace_char: String,
    /// Directory generated env files are written into.
    pub generated_dir: PathBuf,
    /// User-supplied env file injected into the task env at run time.
    pub path: Option<PathBuf>,
}

impl Default for Envfile {
    fn default() -> Self {
        Self {
            generate: false,
            exclude: Vec::new(),
            include: Vec::new(),
            modify: Vec::new(),
            quote: false,
            replace_char: "_".to_string(),
            generated_dir: PathBuf::from(".conveyor"),
            path: None,
        }
    }
}

impl Envfile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject modify rules with an empty pattern; globs are validated lazily
    /// during generation.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.modify {
            if rule.pattern.is_empty() {
                return Err(Error::EnvfileFormat(
                    "modify rule requires a non-empty pattern".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Write the env file at `path` with 0644 permissions, creating parent
    /// directories as needed.
    pub fn generate(&self, env: &HashMap<String, String>, path: &Path) -> Result<()> {
        let exclude = compile_globs(&self.exclude)?;
        let include = compile_globs(&self.include)?;
        let modify: Vec<(globset::GlobMatcher, ModifyOperation)> = self
            .modify
            .iter()
            .map(|rule| Ok((compile_glob(&rule.pattern)?, rule.operation)))
            .collect::<Result<_>>()?;

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();

        let mut contents = String::new();
        for key in keys {
            if exclude.iter().any(|g| g.is_match(key)) {
                continue;
            }
            if !include.is_empty() && !include.iter().any(|g| g.is_match(key)) {
                continue;
            }

            let mut name = sanitize_name(key, &self.replace_char);
            for (matcher, op) in &modify {
                if matcher.is_match(&name) {
                    name = match op {
                        ModifyOperation::Lower => name.to_lowercase(),
                        ModifyOperation::Upper => name.to_uppercase(),
                    };
                }
            }

            let value = &env[key];
            if self.quote {
                contents.push_str(&format!("{name}=\"{value}\"\n"));
            } else {
                contents.push_str(&format!("{name}={value}\n"));
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        write_mode_0644(path, contents.as_bytes())?;
        Ok(())
    }
}

/// Replace characters that are not valid in env var names.
fn sanitize_name(name: &str, replace_char: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push_str(replace_char);
        }
    }
    out
}

fn compile_glob(pattern: &str) -> Result<globset::GlobMatcher> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::EnvfileFormat(format!("bad glob {pattern:?}: {e}")))
}

fn compile_globs(patterns: &[String]) -> Result<Vec<globset::GlobMatcher>> {
    patterns.iter().map(|p| compile_glob(p)).collect()
}

#[cfg(unix)]
fn write_mode_0644(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    file.write_all(contents)
}

#[cfg(not(unix))]
fn write_mode_0644(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_env() -> HashMap<String, String> {
        HashMap::from([
            ("FOO".to_string(), "bar".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
            ("my.key".to_string(), "v".to_string()),
        ])
    }

    #[test]
    fn test_validate_rejects_empty_pattern() {
        let mut envfile = Envfile::new();
        envfile.modify.push(ModifyEnv {
            pattern: String::new(),
            operation: ModifyOperation::Lower,
        });
        assert!(envfile.validate().is_err());
    }

    #[test]
    fn test_default_generated_dir() {
        assert_eq!(Envfile::new().generated_dir, PathBuf::from(".conveyor"));
    }

    #[test]
    fn test_generate_excludes_and_sanitizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.env");

        let mut envfile = Envfile::new();
        envfile.exclude.push("HOME".to_string());
        envfile.generate(&sample_env(), &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("FOO=bar"));
        assert!(contents.contains("my_key=v"));
        assert!(!contents.contains("HOME"));
    }

    #[test]
    fn test_generate_include_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.env");

        let mut envfile = Envfile::new();
        envfile.include.push("FOO".to_string());
        envfile.generate(&sample_env(), &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "FOO=bar\n");
    }

    #[test]
    fn test_generate_quote_and_modify() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.env");

        let mut envfile = Envfile::new();
        envfile.quote = true;
        envfile.modify.push(ModifyEnv {
            pattern: "FOO".to_string(),
            operation: ModifyOperation::Lower,
        });
        envfile.include.push("FOO".to_string());
        envfile.generate(&sample_env(), &path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "foo=\"bar\"\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_generate_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.env");
        Envfile::new().generate(&sample_env(), &path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
