use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::Result;

use crate::{
    dispatch::{DEFAULT_MAX_CONCURRENT, DEFAULT_SCRIPT_TIMEOUT},
    history::DEFAULT_HISTORY_LIMIT,
    queue::DEFAULT_STALE_MINUTES,
    runner::{RunnerConfig, DEFAULT_KILL_GRACE, DEFAULT_MAX_OUTPUT_BYTES},
};

/// Full application configuration, read from the process environment with a
/// `.env` file in the working directory as fallback.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub tasks_file: PathBuf,
    pub history_file: PathBuf,
    pub history_limit: usize,
    pub jobs_file: PathBuf,

    // Scripts
    pub scripts_dir: PathBuf,
    pub script_runtime: String,
    pub max_concurrent_scripts: usize,
    pub script_timeout_s: u64,
    pub kill_grace_s: u64,
    pub max_output_bytes: usize,
    pub await_kill_on_timeout: bool,

    // Queue maintenance
    pub stale_task_minutes: u64,
    pub cleanup_interval_s: u64,

    // Web
    pub web_bind: String,
    pub web_port: u16,

    // Stage worker
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
    pub llm_timeout_s: u64,
    pub worker_poll_s: u64,
    pub worker_role: Option<String>,
}

type Vars = HashMap<String, String>;

fn parse_dotenv(contents: &str) -> Vars {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"').trim_matches('\'');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, vars: &Vars) -> Option<String> {
    vars.get(key).filter(|v| !v.is_empty()).cloned()
}

fn get_str(key: &str, vars: &Vars, default: &str) -> String {
    get(key, vars).unwrap_or_else(|| default.to_string())
}

fn get_bool(key: &str, vars: &Vars, default: bool) -> bool {
    match get(key, vars).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        Some(_) => default,
        None => default,
    }
}

fn get_parsed<T: std::str::FromStr>(key: &str, vars: &Vars, default: T) -> T {
    get(key, vars)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn resolve_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut vars = std::fs::read_to_string(".env")
            .map(|s| parse_dotenv(&s))
            .unwrap_or_default();
        // Process environment wins over .env.
        vars.extend(std::env::vars());
        Ok(Self::from_vars(&vars))
    }

    /// Build from an explicit variable map; unset or unparsable keys take defaults.
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let data_dir = resolve_tilde(&get_str("DATA_DIR", vars, "data"));
        let path_or = |key: &str, default: PathBuf| -> PathBuf {
            get(key, vars).map(|p| resolve_tilde(&p)).unwrap_or(default)
        };

        Config {
            tasks_file: path_or("TASKS_FILE", data_dir.join("tasks.json")),
            history_file: path_or("HISTORY_FILE", data_dir.join("job-history.json")),
            history_limit: get_parsed("HISTORY_LIMIT", vars, DEFAULT_HISTORY_LIMIT),
            jobs_file: path_or("JOBS_FILE", crate::jobs::default_jobs_file(&data_dir)),
            scripts_dir: path_or("SCRIPTS_DIR", PathBuf::from("scripts")),
            script_runtime: get_str("SCRIPT_RUNTIME", vars, "node"),
            max_concurrent_scripts: get_parsed("MAX_CONCURRENT_SCRIPTS", vars, DEFAULT_MAX_CONCURRENT),
            script_timeout_s: get_parsed("SCRIPT_TIMEOUT_S", vars, DEFAULT_SCRIPT_TIMEOUT.as_secs()),
            kill_grace_s: get_parsed("KILL_GRACE_S", vars, DEFAULT_KILL_GRACE.as_secs()),
            max_output_bytes: get_parsed("MAX_OUTPUT_BYTES", vars, DEFAULT_MAX_OUTPUT_BYTES),
            await_kill_on_timeout: get_bool("AWAIT_KILL_ON_TIMEOUT", vars, false),
            stale_task_minutes: get_parsed("STALE_TASK_MINUTES", vars, DEFAULT_STALE_MINUTES),
            cleanup_interval_s: get_parsed("CLEANUP_INTERVAL_S", vars, 300),
            web_bind: get_str("WEB_BIND", vars, "127.0.0.1"),
            web_port: get_parsed("WEB_PORT", vars, 3131),
            llm_base_url: get_str("LLM_BASE_URL", vars, "https://api.openai.com/v1"),
            llm_api_key: get_str("LLM_API_KEY", vars, ""),
            llm_model: get_str("LLM_MODEL", vars, "gpt-4o-mini"),
            llm_temperature: get_parsed("LLM_TEMPERATURE", vars, 0.7),
            llm_max_tokens: get_parsed("LLM_MAX_TOKENS", vars, 4096),
            llm_timeout_s: get_parsed("LLM_TIMEOUT_S", vars, 300),
            worker_poll_s: get_parsed("WORKER_POLL_S", vars, 15),
            worker_role: get("WORKER_ROLE", vars),
            data_dir,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_output_bytes: self.max_output_bytes,
            kill_grace: Duration::from_secs(self.kill_grace_s),
            await_termination: self.await_kill_on_timeout,
        }
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_s)
    }

    pub fn worker_enabled(&self) -> bool {
        !self.llm_api_key.is_empty()
    }
}
