//! Configuration vault – reads/writes `~/.armlink/config.toml`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use armlink_gateway::GatewayConfig;
use armlink_hal::Procedures;
use armlink_runtime::{DEFAULT_PRIMING_PROMPT, TokenBudget};
use armlink_types::Pose;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ────────────────────────────────────────────────────────────────────────────
// ApiKey
// ────────────────────────────────────────────────────────────────────────────

/// Conversation service key.  Wiped from memory on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_empty() { "<not set>" } else { "<redacted>" })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Sections
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub port: u16,
    /// Pause between telemetry cycles; 0 polls continuously.
    pub cycle_delay_ms: u64,
    pub write_timeout_ms: u64,
    pub prompt_queue_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: armlink_gateway::DEFAULT_PORT,
            cycle_delay_ms: 0,
            write_timeout_ms: 1000,
            prompt_queue_capacity: 8,
        }
    }
}

/// Which controller implementation drives the arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorBackend {
    /// The in-process simulated controller.
    #[default]
    Sim,
}

impl fmt::Display for ActuatorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sim => f.write_str("sim"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorSection {
    pub backend: ActuatorBackend,
    pub host: String,
    pub register_index: u16,
    /// `[x, y, z, w, p, r]` used by `home` and `run`.
    pub home_pose: [f64; 6],
    pub program: String,
    pub run_on_startup: bool,
    /// Digital output appended to telemetry lines.
    pub digital_output: Option<u32>,
    pub settle_delay_ms: u64,
    /// Keep serving when the controller cannot be reached at startup.
    pub allow_degraded: bool,
    pub min_reach_mm: f64,
    pub max_reach_mm: f64,
}

impl Default for ActuatorSection {
    fn default() -> Self {
        let procedures = Procedures::default();
        Self {
            backend: ActuatorBackend::default(),
            host: "127.0.0.1".to_string(),
            register_index: procedures.register,
            home_pose: procedures.home_pose.as_array(),
            program: procedures.program,
            run_on_startup: true,
            digital_output: None,
            settle_delay_ms: procedures.settle_delay.as_millis() as u64,
            allow_degraded: false,
            min_reach_mm: 200.0,
            max_reach_mm: 2000.0,
        }
    }
}

/// One example exchange placed after the priming turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FewShot {
    pub user: String,
    pub assistant: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "ApiKey::is_empty")]
    pub api_key: ApiKey,
    pub max_tokens: usize,
    pub reserved_margin: usize,
    pub trajectory_path: PathBuf,
    pub priming_prompt: String,
    pub include_calibration: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub few_shot: Vec<FewShot>,
}

impl Default for LlmSection {
    fn default() -> Self {
        let budget = TokenBudget::default();
        Self {
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            api_key: ApiKey::default(),
            max_tokens: budget.max_tokens,
            reserved_margin: budget.reserved_margin,
            trajectory_path: default_trajectory_path(),
            priming_prompt: DEFAULT_PRIMING_PROMPT.to_string(),
            include_calibration: true,
            few_shot: Vec::new(),
        }
    }
}

fn default_trajectory_path() -> PathBuf {
    std::env::temp_dir().join("RobotData").join("RobotData.json")
}

// ────────────────────────────────────────────────────────────────────────────
// Config
// ────────────────────────────────────────────────────────────────────────────

/// Persisted user configuration stored in `~/.armlink/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub actuator: ActuatorSection,
    pub llm: LlmSection,
}

impl Config {
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            bind_addr: self.server.bind_addr.clone(),
            port: self.server.port,
            cycle_delay: Duration::from_millis(self.server.cycle_delay_ms),
            write_timeout: Duration::from_millis(self.server.write_timeout_ms),
            signal: self.actuator.digital_output,
        }
    }

    pub fn procedures(&self) -> Procedures {
        let [x, y, z, w, p, r] = self.actuator.home_pose;
        Procedures {
            register: self.actuator.register_index,
            home_pose: Pose::new(x, y, z, w, p, r),
            program: self.actuator.program.clone(),
            settle_delay: Duration::from_millis(self.actuator.settle_delay_ms),
        }
    }

    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget {
            max_tokens: self.llm.max_tokens,
            reserved_margin: self.llm.reserved_margin,
        }
    }
}

/// Return the path to `~/.armlink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armlink").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {e}", path.display()))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {e}"))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ARMLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMLINK_PORT` | `server.port` |
/// | `ARMLINK_BIND_ADDR` | `server.bind_addr` |
/// | `ARMLINK_ACTUATOR_HOST` | `actuator.host` |
/// | `ARMLINK_MODEL` | `llm.model` |
/// | `ARMLINK_LLM_URL` | `llm.base_url` |
/// | `ARMLINK_API_KEY`, then `OPENAI_API_KEY` | `llm.api_key` |
/// | `ARMLINK_TRAJECTORY_PATH` | `llm.trajectory_path` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("ARMLINK_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.server.port = port;
    }
    if let Some(v) = var("ARMLINK_BIND_ADDR") {
        cfg.server.bind_addr = v;
    }
    if let Some(v) = var("ARMLINK_ACTUATOR_HOST") {
        cfg.actuator.host = v;
    }
    if let Some(v) = var("ARMLINK_MODEL") {
        cfg.llm.model = v;
    }
    if let Some(v) = var("ARMLINK_LLM_URL") {
        cfg.llm.base_url = v;
    }
    if let Some(v) = var("ARMLINK_API_KEY").or_else(|| var("OPENAI_API_KEY"))
        && !v.is_empty()
    {
        cfg.llm.api_key = ApiKey::new(v);
    }
    if let Some(v) = var("ARMLINK_TRAJECTORY_PATH") {
        cfg.llm.trajectory_path = PathBuf::from(v);
    }
}

/// Save the config to disk, creating `~/.armlink/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {e}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {e}"))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {e}"))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {e}", path.display()))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {e}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn debug_redacts_api_key() {
        let mut cfg = Config::default();
        cfg.llm.api_key = ApiKey::new("sk-super-secret");
        let debug_str = format!("{cfg:?}");
        assert!(!debug_str.contains("sk-super-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = Config::default();
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.server.bind_addr, "127.0.0.1");
        assert_eq!(cfg.actuator.register_index, 3);
        assert_eq!(cfg.actuator.home_pose, [1133.0, 400.0, 1060.0, -10.0, 0.0, 90.0]);
        assert_eq!(cfg.actuator.program, "DAMIEN");
        assert!(!cfg.actuator.allow_degraded);
        assert_eq!(cfg.llm.model, "gpt-3.5-turbo");
        assert_eq!(cfg.token_budget().limit(), 4096 - 32);
        assert!(cfg.llm.trajectory_path.ends_with("RobotData/RobotData.json"));
    }

    #[test]
    fn derived_runtime_settings() {
        let mut cfg = Config::default();
        cfg.server.cycle_delay_ms = 20;
        cfg.actuator.digital_output = Some(4);
        cfg.actuator.home_pose = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let gateway = cfg.gateway();
        assert_eq!(gateway.cycle_delay, Duration::from_millis(20));
        assert_eq!(gateway.signal, Some(4));
        assert_eq!(cfg.procedures().home_pose, Pose::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_preserves_sections() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.server.port = 6001;
        cfg.actuator.digital_output = Some(7);
        cfg.llm.api_key = ApiKey::new("sk-test");
        cfg.llm.few_shot.push(FewShot {
            user: "draw a line".into(),
            assistant: "{\"positions\":[]}".into(),
        });
        save_to(&cfg, &path).expect("save");

        let raw = fs::read_to_string(&path).unwrap();
        let loaded: Config = toml::from_str(&raw).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let cfg: Config = toml::from_str("[server]\nport = 7000\n").unwrap();
        assert_eq!(cfg.server.port, 7000);
        assert_eq!(cfg.server.write_timeout_ms, 1000);
        assert_eq!(cfg.actuator, ActuatorSection::default());
        assert!(cfg.llm.include_calibration);
    }

    #[test]
    fn config_path_points_to_armlink_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".armlink"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn overrides_replace_fields() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[
                ("ARMLINK_PORT", "5050"),
                ("ARMLINK_BIND_ADDR", "0.0.0.0"),
                ("ARMLINK_ACTUATOR_HOST", "192.168.1.20"),
                ("ARMLINK_MODEL", "gpt-4o"),
                ("ARMLINK_LLM_URL", "http://localhost:8000"),
                ("ARMLINK_TRAJECTORY_PATH", "/tmp/out.json"),
            ]),
        );
        assert_eq!(cfg.server.port, 5050);
        assert_eq!(cfg.server.bind_addr, "0.0.0.0");
        assert_eq!(cfg.actuator.host, "192.168.1.20");
        assert_eq!(cfg.llm.model, "gpt-4o");
        assert_eq!(cfg.llm.base_url, "http://localhost:8000");
        assert_eq!(cfg.llm.trajectory_path, PathBuf::from("/tmp/out.json"));
    }

    #[test]
    fn overrides_ignore_invalid_port() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, vars(&[("ARMLINK_PORT", "not-a-port")]));
        assert_eq!(cfg.server.port, 5000);
    }

    #[test]
    fn api_key_prefers_armlink_variable() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[("ARMLINK_API_KEY", "sk-a"), ("OPENAI_API_KEY", "sk-b")]),
        );
        assert_eq!(cfg.llm.api_key.expose(), "sk-a");

        let mut cfg = Config::default();
        apply_overrides(&mut cfg, vars(&[("OPENAI_API_KEY", "sk-b")]));
        assert_eq!(cfg.llm.api_key.expose(), "sk-b");
    }
}
