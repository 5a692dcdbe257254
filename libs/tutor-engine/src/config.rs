// Toolchain configuration for the execution engine
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use crate::error::InfrastructureError;

pub const DEFAULT_TOOLCHAINS_PATH: &str = "config/toolchains.json";
pub const DEFAULT_TOOLCHAIN: &str = "kotlin";

/// One external executable plus its argument vector.
///
/// `{source}` in an argument is replaced by the packaged source file name and
/// `{workdir}` by the absolute work area path. Nothing goes through a shell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn resolve_args(&self, source_file: &str, workdir: &Path) -> Vec<String> {
        let workdir = workdir.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{source}", source_file)
                    .replace("{workdir}", &workdir)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolchainConfig {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Fixed file name the source is written to, so diagnostics always name the same file.
    pub source_file: String,
    /// Absent for interpreted toolchains with no separate build step.
    #[serde(default)]
    pub compile: Option<CommandSpec>,
    pub run: CommandSpec,
    /// Host variables copied into the child environment when set.
    #[serde(default)]
    pub inherit_env: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// `PATH` for the child; the host `PATH` when unset.
    #[serde(default)]
    pub path: Option<String>,
}

impl ToolchainConfig {
    /// Built-in Kotlin/JVM toolchain used when no configuration file exists.
    pub fn kotlin() -> Self {
        Self {
            name: "kotlin".to_string(),
            version: "latest".to_string(),
            source_file: "Main.kt".to_string(),
            compile: Some(CommandSpec::new(
                "kotlinc",
                ["{source}", "-include-runtime", "-d", "main.jar"],
            )),
            run: CommandSpec::new("java", ["-jar", "main.jar"]),
            inherit_env: vec!["JAVA_HOME".to_string(), "KOTLIN_HOME".to_string()],
            env: BTreeMap::new(),
            path: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("Toolchain name cannot be empty");
        }
        let file = self.source_file.as_str();
        if file.is_empty() || file.contains('/') || file.contains('\\') || file == "." || file == ".." {
            bail!(
                "Toolchain '{}' has invalid source_file '{}': expected a bare file name",
                self.name,
                file
            );
        }
        if self.run.program.trim().is_empty() {
            bail!("Toolchain '{}' has an empty run program", self.name);
        }
        if let Some(compile) = &self.compile {
            if compile.program.trim().is_empty() {
                bail!("Toolchain '{}' has an empty compile program", self.name);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ToolchainsJson {
    toolchains: Vec<ToolchainConfig>,
}

/// Toolchain registry keyed by name.
#[derive(Debug, Clone)]
pub struct ToolchainRegistry {
    toolchains: HashMap<String, ToolchainConfig>,
}

impl ToolchainRegistry {
    /// Load toolchain configurations from a toolchains.json file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Toolchain config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Invalid toolchain config {}", config_path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let parsed: ToolchainsJson =
            serde_json::from_str(content).context("Failed to parse toolchains JSON")?;
        Self::from_toolchains(parsed.toolchains)
    }

    pub fn from_toolchains(toolchains: Vec<ToolchainConfig>) -> Result<Self> {
        let mut map = HashMap::new();
        for toolchain in toolchains {
            toolchain.validate()?;
            if map.contains_key(&toolchain.name) {
                bail!("Toolchain '{}' is configured twice", toolchain.name);
            }
            map.insert(toolchain.name.clone(), toolchain);
        }
        if map.is_empty() {
            bail!("No toolchains configured");
        }
        Ok(Self { toolchains: map })
    }

    /// Registry holding only the built-in Kotlin toolchain.
    pub fn builtin() -> Self {
        let kotlin = ToolchainConfig::kotlin();
        let mut toolchains = HashMap::new();
        toolchains.insert(kotlin.name.clone(), kotlin);
        Self { toolchains }
    }

    /// Load from `TUTOR_TOOLCHAINS_CONFIG` or `config/toolchains.json`,
    /// falling back to the built-in toolchain when neither file exists.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("TUTOR_TOOLCHAINS_CONFIG")
            .unwrap_or_else(|_| DEFAULT_TOOLCHAINS_PATH.to_string());
        let path = Path::new(&path);
        if path.exists() {
            Self::load(path)
        } else {
            tracing::warn!(
                path = %path.display(),
                "Toolchain config not found, using built-in kotlin toolchain"
            );
            Ok(Self::builtin())
        }
    }

    pub fn get(&self, name: &str) -> Result<&ToolchainConfig, InfrastructureError> {
        self.toolchains
            .get(name)
            .ok_or_else(|| InfrastructureError::UnknownToolchain(name.to_string()))
    }

    /// Sorted toolchain names
    pub fn list_toolchains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.toolchains.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Name of the toolchain selected through `TUTOR_TOOLCHAIN`.
pub fn active_toolchain_name() -> String {
    std::env::var("TUTOR_TOOLCHAIN")
        .ok()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_TOOLCHAIN.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const SAMPLE: &str = r#"{
        "toolchains": [
            {
                "name": "kotlin",
                "version": "2.0",
                "source_file": "Main.kt",
                "compile": { "program": "kotlinc", "args": ["{source}", "-d", "main.jar"] },
                "run": { "program": "java", "args": ["-jar", "main.jar"] },
                "inherit_env": ["JAVA_HOME"]
            },
            {
                "name": "python",
                "source_file": "main.py",
                "run": { "program": "python3", "args": ["-u", "{source}"] }
            }
        ]
    }"#;

    #[test]
    fn test_parse_registry() {
        let registry = ToolchainRegistry::from_json(SAMPLE).unwrap();
        assert_eq!(registry.list_toolchains(), vec!["kotlin", "python"]);

        let python = registry.get("python").unwrap();
        assert!(python.compile.is_none());
        assert!(python.env.is_empty());
        assert_eq!(registry.get("kotlin").unwrap().inherit_env, vec!["JAVA_HOME"]);
    }

    #[test]
    fn test_unknown_toolchain() {
        let registry = ToolchainRegistry::builtin();
        let err = registry.get("cobol").unwrap_err();
        assert!(matches!(err, InfrastructureError::UnknownToolchain(name) if name == "cobol"));
    }

    #[test]
    fn test_rejects_source_file_with_path() {
        let mut toolchain = ToolchainConfig::kotlin();
        toolchain.source_file = "../Main.kt".to_string();
        assert!(ToolchainRegistry::from_toolchains(vec![toolchain]).is_err());
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        let kotlin = ToolchainConfig::kotlin();
        assert!(ToolchainRegistry::from_toolchains(vec![kotlin.clone(), kotlin]).is_err());
        assert!(ToolchainRegistry::from_toolchains(vec![]).is_err());
    }

    #[test]
    fn test_resolve_args_placeholders() {
        let spec = CommandSpec::new("kotlinc", ["{source}", "-d", "{workdir}/main.jar"]);
        let args = spec.resolve_args("Main.kt", &PathBuf::from("/tmp/area"));
        assert_eq!(args, vec!["Main.kt", "-d", "/tmp/area/main.jar"]);
    }

    #[test]
    fn test_shipped_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/toolchains.json");
        let registry = ToolchainRegistry::load(&path).unwrap();
        assert!(registry.get(DEFAULT_TOOLCHAIN).is_ok());
    }
}
