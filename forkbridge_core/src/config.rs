use serde::Deserialize;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Environment variable carrying the SysV shared memory id of the coverage map.
pub const DEFAULT_SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// Environment variable overriding the coverage map size.
pub const MAP_SIZE_ENV_VAR: &str = "AFL_MAP_SIZE";
/// Environment variable switching persistent mode off (`0`, `false`, `no`, `off`).
pub const PERSISTENT_ENV_VAR: &str = "FORKBRIDGE_PERSISTENT";

/// Read end of the control channel; the write end is always the next descriptor.
pub const DEFAULT_CONTROL_FD: RawFd = 198;
pub const DEFAULT_MAP_SIZE: usize = 1 << 16;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessSettings {
    #[serde(default = "default_iterations")]
    pub iterations: u64,
}

pub fn default_iterations() -> u64 {
    1000
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    #[serde(default = "default_shm_env_var")]
    pub shm_env_var: String,
    #[serde(default = "default_control_fd")]
    pub control_fd: RawFd,
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default = "default_true")]
    pub abort_on_panic: bool,
    #[serde(default)]
    pub harness: Option<HarnessSettings>,
}

fn default_shm_env_var() -> String {
    DEFAULT_SHM_ENV_VAR.to_string()
}

fn default_control_fd() -> RawFd {
    DEFAULT_CONTROL_FD
}

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

fn default_true() -> bool {
    true
}

impl BridgeConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: BridgeConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        if config.map_size == 0 {
            return Err(anyhow::anyhow!(
                "map-size in config file {:?} must be greater than zero",
                path
            ));
        }

        Ok(config)
    }

    /// Built-in defaults with the process environment layered on top.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), anyhow::Error> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides using `lookup` as the environment.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(MAP_SIZE_ENV_VAR) {
            let size: usize = raw.trim().parse().map_err(|e| {
                anyhow::anyhow!("Invalid {} value {:?}: {}", MAP_SIZE_ENV_VAR, raw, e)
            })?;
            if size == 0 {
                return Err(anyhow::anyhow!(
                    "{} must be greater than zero",
                    MAP_SIZE_ENV_VAR
                ));
            }
            self.map_size = size;
        }

        if let Some(raw) = lookup(PERSISTENT_ENV_VAR) {
            self.persistent = parse_switch(&raw).ok_or_else(|| {
                anyhow::anyhow!("Invalid {} value {:?}", PERSISTENT_ENV_VAR, raw)
            })?;
        }

        Ok(())
    }

    pub fn read_fd(&self) -> RawFd {
        self.control_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.control_fd + 1
    }

    pub fn iterations(&self) -> u64 {
        self.harness
            .as_ref()
            .map_or(default_iterations(), |h| h.iterations)
    }
}

fn parse_switch(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            shm_env_var: default_shm_env_var(),
            control_fd: default_control_fd(),
            map_size: default_map_size(),
            persistent: true,
            abort_on_panic: true,
            harness: Some(HarnessSettings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_afl_conventions() {
        let config = BridgeConfig::default();
        assert_eq!(config.shm_env_var, "__AFL_SHM_ID");
        assert_eq!(config.read_fd(), 198);
        assert_eq!(config.write_fd(), 199);
        assert_eq!(config.map_size, 65536);
        assert!(config.persistent);
        assert!(config.abort_on_panic);
        assert_eq!(config.iterations(), 1000);
    }

    #[test]
    fn load_from_file_reads_kebab_case_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "map-size = 4096\ncontrol-fd = 60\npersistent = false\n\n[harness]\niterations = 7"
        )
        .unwrap();

        let config = BridgeConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.map_size, 4096);
        assert_eq!(config.read_fd(), 60);
        assert_eq!(config.write_fd(), 61);
        assert!(!config.persistent);
        assert!(config.abort_on_panic, "unspecified fields keep defaults");
        assert_eq!(config.iterations(), 7);
        assert_eq!(config.shm_env_var, DEFAULT_SHM_ENV_VAR);
    }

    #[test]
    fn load_from_file_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "map-size = 4096\nmystery = 1").unwrap();

        let err = BridgeConfig::load_from_file(file.path()).unwrap_err();
        assert!(
            err.to_string().contains("Failed to parse TOML"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn load_from_file_rejects_zero_map_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "map-size = 0").unwrap();
        assert!(BridgeConfig::load_from_file(file.path()).is_err());
    }

    #[test]
    fn load_from_missing_file_fails() {
        let err = BridgeConfig::load_from_file(Path::new("/nonexistent/forkbridge.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn env_overrides_map_size_and_persistence() {
        let mut config = BridgeConfig::default();
        config
            .apply_overrides_from(env_of(&[
                (MAP_SIZE_ENV_VAR, "262144"),
                (PERSISTENT_ENV_VAR, "off"),
            ]))
            .unwrap();
        assert_eq!(config.map_size, 262144);
        assert!(!config.persistent);
    }

    #[test]
    fn env_without_overrides_leaves_config_untouched() {
        let mut config = BridgeConfig::default();
        config.apply_overrides_from(env_of(&[])).unwrap();
        assert_eq!(config.map_size, DEFAULT_MAP_SIZE);
        assert!(config.persistent);
    }

    #[test]
    fn env_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        assert!(
            config
                .apply_overrides_from(env_of(&[(MAP_SIZE_ENV_VAR, "lots")]))
                .is_err()
        );
        assert!(
            config
                .apply_overrides_from(env_of(&[(MAP_SIZE_ENV_VAR, "0")]))
                .is_err()
        );
        assert!(
            config
                .apply_overrides_from(env_of(&[(PERSISTENT_ENV_VAR, "maybe")]))
                .is_err()
        );
        assert_eq!(config.map_size, DEFAULT_MAP_SIZE);
    }
}
