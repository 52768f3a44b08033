//! Configuration for folder mappings and the tool itself.
//!
//! Two layers are read:
//!
//! - **Mapping files**: a `.scp` JSON file in a local directory marks that
//!   directory as the root of a mapping to a remote host.
//! - **Settings**: `~/.config/scp-sync/settings.toml` chooses the external
//!   programs and a few behavioural switches. Environment variables win over
//!   the file.
//!
//! ```json
//! {
//!     // remote host name or IP address
//!     "host": "192.168.0.1",
//!     "user": "guest",
//!     "path": "/home/guest",
//!     "remap": [{ "pattern": "build", "replacement": "www" }],
//!     "include": ["*.py", "*.html"]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, ScpError};

/// Name of the marker file that maps a folder to a remote host.
pub const MAPPING_FILE: &str = ".scp";

/// Starting point written by `map`; comment lines are stripped on load.
pub const TEMPLATE: &str = r#"{
    // remote host name or IP address
    "host": "192.168.0.1",
    "port": 22,
    "user": "guest",
    "passwd": "guest",
    // remote path to use as root
    "path": "/home/guest"
}
"#;

/// Wildcard `hostkey` value: accept whatever fingerprint the host presents.
pub const HOSTKEY_AUTO_ACCEPT: &str = "*";

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_remote_root() -> String {
    "/".to_string()
}

/// One `{pattern, replacement}` entry of a mapping's `remap` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemapSpec {
    /// Glob matched against leading directories of a relative path.
    pub pattern: String,
    /// Text substituted for the matched directories (may be empty).
    #[serde(default)]
    pub replacement: String,
}

/// Contents of a `.scp` mapping file.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub passwd: Option<String>,
    /// Accepted host-key fingerprint, or `*` to accept unknown keys.
    #[serde(default)]
    pub hostkey: Option<String>,
    /// Remote directory the local root maps onto.
    #[serde(default = "default_remote_root")]
    pub path: String,
    #[serde(default)]
    pub remap: Vec<RemapSpec>,
    #[serde(default)]
    pub include: Vec<String>,
}

impl MappingConfig {
    /// Parse mapping JSON, tolerating whole-line `//` comments.
    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        let stripped: String = text
            .lines()
            .filter(|line| !line.trim_start().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        serde_json::from_str(&stripped)
    }

    /// Load the mapping file stored in `root`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(MAPPING_FILE);
        let text = fs::read_to_string(&path).map_err(|e| ScpError::Config {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&text).map_err(|e| ScpError::Config {
            path,
            reason: e.to_string(),
        })
    }

    /// Whether unknown host keys should be accepted during the handshake.
    pub fn auto_accept_hostkey(&self) -> bool {
        self.hostkey.as_deref() == Some(HOSTKEY_AUTO_ACCEPT)
    }
}

/// Walk upward from `path` to the first directory holding a mapping file.
pub fn find_root(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .find(|dir| dir.join(MAPPING_FILE).is_file())
        .map(Path::to_path_buf)
}

/// Write the mapping template into `dir` unless a mapping already exists.
///
/// Returns the path of the mapping file.
pub fn write_template(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(MAPPING_FILE);
    if !path.exists() {
        fs::create_dir_all(dir)?;
        fs::write(&path, TEMPLATE)?;
        tracing::info!(path = %path.display(), "wrote mapping template");
    }
    Ok(path)
}

// =============================================================================
// Settings
// =============================================================================

fn default_shell_program() -> String {
    "plink".to_string()
}

fn default_copy_program() -> String {
    "pscp".to_string()
}

fn default_remote_tmp_dir() -> String {
    "/tmp".to_string()
}

fn default_ignore() -> Vec<String> {
    vec![MAPPING_FILE.to_string(), ".git".to_string()]
}

fn default_true() -> bool {
    true
}

/// User level settings shared by all mappings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Remote-shell executor (plink compatible command line).
    #[serde(default = "default_shell_program")]
    pub shell_program: String,
    /// File-copy tool (pscp compatible command line).
    #[serde(default = "default_copy_program")]
    pub copy_program: String,
    /// Remote directory receiving temporary bulk archives.
    #[serde(default = "default_remote_tmp_dir")]
    pub remote_tmp_dir: String,
    /// Path fragments never transferred.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    /// Upload files after they are saved.
    #[serde(default = "default_true")]
    pub auto_upload: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            shell_program: default_shell_program(),
            copy_program: default_copy_program(),
            remote_tmp_dir: default_remote_tmp_dir(),
            ignore: default_ignore(),
            auto_upload: true,
        }
    }
}

impl Settings {
    /// Default location: `<config dir>/scp-sync/settings.toml`.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "scp-sync")
            .map(|dirs| dirs.config_dir().join("settings.toml"))
    }

    /// Load settings from the default location plus environment overrides.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default().with_env_overrides()),
        }
    }

    /// Load settings from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            let text = fs::read_to_string(path)?;
            toml::from_str(&text).map_err(|e| ScpError::Config {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else {
            Self::default()
        };
        Ok(settings.with_env_overrides())
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("SCP_SYNC_SHELL") {
            self.shell_program = value;
        }
        if let Ok(value) = std::env::var("SCP_SYNC_COPY") {
            self.copy_program = value;
        }
        if let Ok(value) = std::env::var("SCP_SYNC_TMP") {
            self.remote_tmp_dir = value;
        }
        self
    }

    /// Whether `path` contains one of the ignored fragments.
    pub fn is_ignored(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.ignore.iter().any(|fragment| text.contains(fragment.as_str()))
    }

    /// Warn about external programs that are not on `PATH`.
    pub fn check_programs(&self) -> bool {
        let mut all_found = true;
        for program in [&self.shell_program, &self.copy_program] {
            if let Err(e) = which::which(program) {
                tracing::warn!(program = %program, error = %e, "external program not found");
                all_found = false;
            }
        }
        all_found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_template_defaults() {
        let config = MappingConfig::parse(TEMPLATE).unwrap();
        assert_eq!(config.host, "192.168.0.1");
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "guest");
        assert_eq!(config.passwd.as_deref(), Some("guest"));
        assert_eq!(config.path, "/home/guest");
        assert!(config.remap.is_empty());
        assert!(!config.auto_accept_hostkey());
    }

    #[test]
    fn test_parse_minimal_mapping() {
        let config = MappingConfig::parse(r#"{"host": "example.org"}"#).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "guest");
        assert_eq!(config.path, "/");
        assert!(config.passwd.is_none());
        assert!(config.include.is_empty());
    }

    #[test]
    fn test_parse_remap_and_include() {
        let config = MappingConfig::parse(
            r#"{
                "host": "example.org",
                "hostkey": "*",
                "remap": [{"pattern": "build", "replacement": "www"}],
                "include": ["*.py"]
            }"#,
        )
        .unwrap();
        assert!(config.auto_accept_hostkey());
        assert_eq!(
            config.remap,
            vec![RemapSpec {
                pattern: "build".into(),
                replacement: "www".into()
            }]
        );
        assert_eq!(config.include, vec!["*.py".to_string()]);
    }

    #[test]
    fn test_parse_requires_host() {
        assert!(MappingConfig::parse(r#"{"port": 2222}"#).is_err());
    }

    #[test]
    fn test_find_root_walks_upward() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("project");
        let nested = root.join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();
        fs::write(root.join(MAPPING_FILE), TEMPLATE).unwrap();

        assert_eq!(find_root(&nested), Some(root.clone()));
        assert_eq!(find_root(&root.join("src/deep/file.py")), Some(root.clone()));
        assert_eq!(find_root(&root), Some(root));
        assert_eq!(find_root(tmp.path()), None);
    }

    #[test]
    fn test_find_root_prefers_nearest_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let outer = tmp.path().join("outer");
        let inner = outer.join("inner");
        fs::create_dir_all(&inner).unwrap();
        fs::write(outer.join(MAPPING_FILE), TEMPLATE).unwrap();
        fs::write(inner.join(MAPPING_FILE), TEMPLATE).unwrap();

        assert_eq!(find_root(&inner.join("a.txt")), Some(inner));
    }

    #[test]
    fn test_write_template_keeps_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_template(tmp.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), TEMPLATE);

        fs::write(&path, r#"{"host": "kept"}"#).unwrap();
        write_template(tmp.path()).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"host": "kept"}"#);
    }

    #[test]
    fn test_load_reports_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MAPPING_FILE), "{ not json").unwrap();
        let err = MappingConfig::load(tmp.path()).unwrap_err();
        assert!(matches!(err, ScpError::Config { .. }));
    }

    #[test]
    #[serial]
    fn test_settings_file_and_env_override() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("settings.toml");
        fs::write(
            &path,
            "shell_program = \"ssh-exec\"\ncopy_program = \"scp-copy\"\nauto_upload = false\n",
        )
        .unwrap();

        // SAFETY: serialized with other environment-touching tests.
        unsafe { std::env::set_var("SCP_SYNC_COPY", "override-copy") };
        let settings = Settings::load_from(&path).unwrap();
        unsafe { std::env::remove_var("SCP_SYNC_COPY") };

        assert_eq!(settings.shell_program, "ssh-exec");
        assert_eq!(settings.copy_program, "override-copy");
        assert_eq!(settings.remote_tmp_dir, "/tmp");
        assert!(!settings.auto_upload);
    }

    #[test]
    #[serial]
    fn test_settings_missing_file_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_is_ignored() {
        let settings = Settings::default();
        assert!(settings.is_ignored(Path::new("/work/site/.git/config")));
        assert!(settings.is_ignored(Path::new("/work/site/.scp")));
        assert!(!settings.is_ignored(Path::new("/work/site/index.html")));
    }
}
