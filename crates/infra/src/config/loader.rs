//! Configuration loader
//!
//! Loads application configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. If `CADENCE_CONFIG` names a file, load it and apply environment
//!    overrides on top
//! 2. Otherwise, if `CADENCE_NODE_ID` is set, build the configuration from
//!    defaults plus environment variables
//! 3. Otherwise, probe the standard paths for a config file
//! 4. Validate the result
//!
//! Every setting has a default, so files and the environment only need the
//! keys they change. Circuit and rate-limit tables can only be set in files.
//!
//! ## Environment Variables
//! - `CADENCE_CONFIG`: Explicit config file path
//! - `CADENCE_NODE_ID`: Worker identity (selects environment loading)
//! - `CADENCE_SCHEDULER_ENABLED`: Whether the poll loop runs (true/false)
//! - `CADENCE_POLL_INTERVAL_MS`: Scheduler poll interval
//! - `CADENCE_QUEUES`: Comma-separated queues this node serves
//! - `CADENCE_BATCH_LIMIT`: Due jobs claimed per queue per tick
//! - `CADENCE_LOCK_TTL_MS`: Claim and unique lock TTL
//! - `CADENCE_HEARTBEAT_INTERVAL_MS`: Heartbeat period of running executions
//! - `CADENCE_STUCK_CUTOFF_MS`: Heartbeat age after which an execution is rescued
//! - `CADENCE_SWEEP_INTERVAL_MS`: Stuck-execution sweep period
//! - `CADENCE_TIMEZONE`: Default IANA timezone for cron schedules
//! - `CADENCE_MAX_HISTORY`: Executions kept per job
//! - `CADENCE_HISTORY_MAX_AGE_SECS`: Age after which finished executions are pruned
//! - `CADENCE_KEY_PREFIX`: Key prefix in the key-value backend
//! - `CADENCE_WORKFLOW_CONCURRENCY`: Concurrent steps per workflow run
//! - `CADENCE_STEP_TIMEOUT_MS`: Default step timeout
//! - `CADENCE_MAX_RETRIES`: Default step retries
//! - `CADENCE_LOG_LEVEL`: `EnvFilter` directive used when `RUST_LOG` is unset
//! - `CADENCE_LOG_JSON`: Emit JSON logs (true/false)
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./config.{json,toml}` or `./cadence.{json,toml}` (current working
//!    directory)
//! 2. `../config.{json,toml}` and `../../config.{json,toml}`
//! 3. The same names relative to the executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;

use cadence_domain::{CadenceError, Config, Result};

const CONFIG_PATH_VAR: &str = "CADENCE_CONFIG";
const NODE_ID_VAR: &str = "CADENCE_NODE_ID";

/// Load and validate configuration with automatic fallback strategy
///
/// # Errors
/// Returns `CadenceError::Config` if:
/// - Configuration cannot be loaded from any source
/// - File format is invalid
/// - An environment variable has an invalid value
/// - The result fails validation
pub fn load() -> Result<Config> {
    let config = match std::env::var(CONFIG_PATH_VAR) {
        Ok(path) => {
            let mut config = load_from_file(Some(PathBuf::from(path)))?;
            apply_env(&mut config)?;
            config
        }
        Err(_) => match load_from_env() {
            Ok(config) => {
                tracing::info!("Configuration loaded from environment variables");
                config
            }
            Err(e) => {
                tracing::debug!(error = ?e, "Failed to load from environment, trying file");
                load_from_file(None)?
            }
        },
    };
    config.validate()?;
    Ok(config)
}

/// Load configuration from environment variables
///
/// `CADENCE_NODE_ID` must be present; every other variable is optional and
/// overrides the default.
///
/// # Errors
/// Returns `CadenceError::Config` if `CADENCE_NODE_ID` is missing or a
/// variable has an invalid value.
pub fn load_from_env() -> Result<Config> {
    env_var(NODE_ID_VAR)?;
    let mut config = Config::default();
    apply_env(&mut config)?;
    Ok(config)
}

/// Overlay every `CADENCE_*` variable that is set onto `config`
///
/// # Errors
/// Returns `CadenceError::Config` naming the first variable that fails to
/// parse.
pub fn apply_env(config: &mut Config) -> Result<()> {
    let scheduler = &mut config.scheduler;
    if let Ok(node_id) = std::env::var(NODE_ID_VAR) {
        scheduler.node_id = node_id;
    }
    scheduler.enabled = env_bool("CADENCE_SCHEDULER_ENABLED", scheduler.enabled);
    override_with(&mut scheduler.poll_interval_ms, "CADENCE_POLL_INTERVAL_MS")?;
    if let Ok(queues) = std::env::var("CADENCE_QUEUES") {
        scheduler.queues = queues
            .split(',')
            .map(str::trim)
            .filter(|queue| !queue.is_empty())
            .map(str::to_string)
            .collect();
    }
    override_with(&mut scheduler.batch_limit, "CADENCE_BATCH_LIMIT")?;
    override_with(&mut scheduler.lock_ttl_ms, "CADENCE_LOCK_TTL_MS")?;
    override_with(&mut scheduler.heartbeat_interval_ms, "CADENCE_HEARTBEAT_INTERVAL_MS")?;
    override_with(&mut scheduler.stuck_cutoff_ms, "CADENCE_STUCK_CUTOFF_MS")?;
    override_with(&mut scheduler.sweep_interval_ms, "CADENCE_SWEEP_INTERVAL_MS")?;
    override_with(&mut scheduler.default_timezone, "CADENCE_TIMEZONE")?;

    let store = &mut config.store;
    override_with(&mut store.max_history, "CADENCE_MAX_HISTORY")?;
    override_with(&mut store.history_max_age_secs, "CADENCE_HISTORY_MAX_AGE_SECS")?;
    override_with(&mut store.key_prefix, "CADENCE_KEY_PREFIX")?;

    let workflow = &mut config.workflow;
    override_with(&mut workflow.max_concurrency, "CADENCE_WORKFLOW_CONCURRENCY")?;
    override_with(&mut workflow.default_step_timeout_ms, "CADENCE_STEP_TIMEOUT_MS")?;
    override_with(&mut workflow.default_max_retries, "CADENCE_MAX_RETRIES")?;

    override_with(&mut config.logging.level, "CADENCE_LOG_LEVEL")?;
    config.logging.json = env_bool("CADENCE_LOG_JSON", config.logging.json);
    Ok(())
}

/// Load configuration from a file
///
/// If `path` is `None`, probes multiple locations for config files.
/// Supports both JSON and TOML formats (detected by file extension).
///
/// # Errors
/// Returns `CadenceError::Config` if:
/// - File not found (when path is specified)
/// - No config file found (when path is `None`)
/// - File format is invalid
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(CadenceError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            CadenceError::Config(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| CadenceError::Config(format!("Failed to read config file: {}", e)))?;

    parse_config(&contents, &config_path)
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| CadenceError::Config(format!("Invalid TOML format: {}", e))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| CadenceError::Config(format!("Invalid JSON format: {}", e))),
        _ => Err(CadenceError::Config(format!("Unsupported config format: {}", extension))),
    }
}

/// Probe multiple paths for configuration files
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    const NAMES: [&str; 8] = [
        "config.json",
        "config.toml",
        "cadence.json",
        "cadence.toml",
        "../config.json",
        "../config.toml",
        "../../config.json",
        "../../config.toml",
    ];

    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd);
    }
    if let Some(exe_dir) =
        std::env::current_exe().ok().and_then(|p| p.parent().map(Path::to_path_buf))
    {
        roots.push(exe_dir);
    }

    roots
        .iter()
        .flat_map(|root| NAMES.iter().map(move |name| root.join(name)))
        .find(|path| path.exists())
}

/// Get required environment variable
///
/// # Errors
/// Returns `CadenceError::Config` if the variable is not set.
fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| {
        CadenceError::Config(format!("Missing required environment variable: {}", key))
    })
}

/// Replace `target` with the parsed value of `key` when it is set
fn override_with<T>(target: &mut T, key: &str) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| CadenceError::Config(format!("Invalid value for {}: {}", key, e)))?;
    }
    Ok(())
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex;

    use tempfile::NamedTempFile;

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: [&str; 6] = [
        "CADENCE_CONFIG",
        "CADENCE_NODE_ID",
        "CADENCE_QUEUES",
        "CADENCE_POLL_INTERVAL_MS",
        "CADENCE_LOG_JSON",
        "CADENCE_KEY_PREFIX",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    fn temp_config(contents: &str, extension: &str) -> NamedTempFile {
        let mut file =
            tempfile::Builder::new().suffix(&format!(".{extension}")).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_env_bool_parsing() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");

        std::env::set_var("TEST_CADENCE_BOOL_YES", "yes");
        std::env::set_var("TEST_CADENCE_BOOL_UPPER", "TRUE");
        std::env::set_var("TEST_CADENCE_BOOL_OFF", "off");

        assert!(env_bool("TEST_CADENCE_BOOL_YES", false));
        assert!(env_bool("TEST_CADENCE_BOOL_UPPER", false));
        assert!(!env_bool("TEST_CADENCE_BOOL_OFF", true));
        assert!(env_bool("TEST_CADENCE_BOOL_MISSING", true));

        std::env::remove_var("TEST_CADENCE_BOOL_YES");
        std::env::remove_var("TEST_CADENCE_BOOL_UPPER");
        std::env::remove_var("TEST_CADENCE_BOOL_OFF");
    }

    #[test]
    fn test_load_from_env_overrides_defaults() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var("CADENCE_NODE_ID", "worker-7");
        std::env::set_var("CADENCE_QUEUES", "reports, billing,,");
        std::env::set_var("CADENCE_POLL_INTERVAL_MS", "250");
        std::env::set_var("CADENCE_LOG_JSON", "1");

        let config = load_from_env().unwrap();
        assert_eq!(config.scheduler.node_id, "worker-7");
        assert_eq!(config.scheduler.queues, vec!["reports", "billing"]);
        assert_eq!(config.scheduler.poll_interval_ms, 250);
        assert!(config.logging.json);
        assert_eq!(config.store.key_prefix, "cadence");

        clear_env();
    }

    #[test]
    fn test_load_from_env_requires_node_id() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        let err = load_from_env().unwrap_err();
        assert!(matches!(err, CadenceError::Config(_)), "Should be a Config error");
        assert!(err.to_string().contains("CADENCE_NODE_ID"));
    }

    #[test]
    fn test_load_from_env_invalid_number() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        std::env::set_var("CADENCE_NODE_ID", "worker-1");
        std::env::set_var("CADENCE_POLL_INTERVAL_MS", "soon");

        let err = load_from_env().unwrap_err();
        assert!(err.to_string().contains("CADENCE_POLL_INTERVAL_MS"));

        clear_env();
    }

    #[test]
    fn test_explicit_file_gets_env_overrides_and_validation() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        let file = temp_config(
            "[scheduler]\nnode_id = \"from-file\"\n[store]\nkey_prefix = \"file\"\n",
            "toml",
        );
        std::env::set_var("CADENCE_CONFIG", file.path());
        std::env::set_var("CADENCE_KEY_PREFIX", "env");

        let config = load().unwrap();
        assert_eq!(config.scheduler.node_id, "from-file");
        assert_eq!(config.store.key_prefix, "env");

        std::env::set_var("CADENCE_QUEUES", " , ");
        assert!(matches!(load(), Err(CadenceError::Config(_))), "empty queue list is invalid");

        clear_env();
    }

    #[test]
    fn test_parse_config_formats() {
        let json =
            parse_config(r#"{"scheduler": {"batch_limit": 5}}"#, Path::new("c.json")).unwrap();
        assert_eq!(json.scheduler.batch_limit, 5);

        let toml = parse_config("[workflow]\nmax_concurrency = 2\n", Path::new("c.toml")).unwrap();
        assert_eq!(toml.workflow.max_concurrency, 2);

        assert!(parse_config("{ not json", Path::new("c.json")).is_err());
        assert!(parse_config("a: b", Path::new("c.yaml")).is_err());
    }

    #[test]
    fn test_load_from_file_not_found() {
        let result = load_from_file(Some(PathBuf::from("/nonexistent/cadence.toml")));
        assert!(matches!(result, Err(CadenceError::Config(_))));
    }
}
