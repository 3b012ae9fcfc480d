//! Configuration: which server to talk to, as which user.
//!
//! Settings come from a per-environment TOML file, overridden by `CALDO_*`
//! environment variables. Environments ("envs") are fully separate task
//! worlds, each with its own config file and cache database.

use std::error::Error;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::normalize_env;

/// The default environment name
pub const DEFAULT_ENV: &str = "default";

/// Everything needed to reach one CalDAV calendar
#[derive(Clone, Debug)]
pub struct CaldavConfig {
    pub calendar_url: String,
    pub username: String,
    /// Basic-auth password; ignored when a bearer token is set
    pub password: Option<String>,
    pub token: Option<String>,
    pub env: String,
    /// Show full uids instead of stable indices in listings
    pub show_uids: bool,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct ConfigFile {
    caldav: Option<CaldavSection>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct CaldavSection {
    calendar_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    show_uids: Option<bool>,
}

/// Resolve the environment name: explicit flag, then `CALDO_ENV`, then
/// [`DEFAULT_ENV`]
pub fn resolve_env(explicit: Option<&str>) -> String {
    if let Some(env) = explicit {
        return normalize_env(env);
    }
    match std::env::var("CALDO_ENV") {
        Ok(env) if !env.trim().is_empty() => normalize_env(&env),
        _ => DEFAULT_ENV.to_string(),
    }
}

/// Where the config file for an environment lives.
/// `CALDO_CONFIG_FILE` overrides the computed location.
pub fn config_file_path(env: &str) -> PathBuf {
    if let Ok(path) = std::env::var("CALDO_CONFIG_FILE") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    let file_name = if env == DEFAULT_ENV {
        "config.toml".to_string()
    } else {
        format!("config.{}.toml", env)
    };
    config_home().join(file_name)
}

fn config_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("caldo")
}

/// Load the configuration for an environment.
///
/// The TOML file is optional; `CALDO_CALDAV_URL`, `CALDO_USERNAME`,
/// `CALDO_PASSWORD` and `CALDO_TOKEN` override whatever it contains.
/// Fails when no calendar URL or username can be found anywhere.
pub fn load_config(explicit_env: Option<&str>) -> Result<CaldavConfig, Box<dyn Error>> {
    let env = resolve_env(explicit_env);
    let path = config_file_path(&env);
    let section = if path.exists() {
        read_config_file(&path)?
    } else {
        CaldavSection::default()
    };

    let calendar_url = env_override("CALDO_CALDAV_URL").or(section.calendar_url);
    let username = env_override("CALDO_USERNAME").or(section.username);
    let password = env_override("CALDO_PASSWORD").or(section.password);
    let token = env_override("CALDO_TOKEN").or(section.token);

    let calendar_url = calendar_url.ok_or_else(|| {
        format!(
            "no calendar URL configured; set CALDO_CALDAV_URL or add it to {}",
            path.display()
        )
    })?;
    let username = username.ok_or_else(|| {
        format!(
            "no username configured; set CALDO_USERNAME or add it to {}",
            path.display()
        )
    })?;

    let show_uids = match env_override("CALDO_SHOW_UIDS") {
        Some(raw) => matches!(raw.as_str(), "1" | "true" | "yes"),
        None => section.show_uids.unwrap_or(false),
    };

    Ok(CaldavConfig {
        calendar_url,
        username,
        password,
        token,
        env,
        show_uids,
    })
}

fn read_config_file(path: &Path) -> Result<CaldavSection, Box<dyn Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("cannot read {}: {}", path.display(), err))?;
    let parsed: ConfigFile = toml::from_str(&raw)
        .map_err(|err| format!("cannot parse {}: {}", path.display(), err))?;
    Ok(parsed.caldav.unwrap_or_default())
}

fn env_override(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

/// Write a starter config file for an environment and return its path.
/// Refuses to overwrite an existing file unless `force` is on.
pub fn init_config_file(env: &str, force: bool) -> Result<PathBuf, Box<dyn Error>> {
    let path = config_file_path(env);
    if path.exists() && !force {
        return Err(format!("{} already exists (use --force to overwrite)", path.display()).into());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let template = ConfigFile {
        caldav: Some(CaldavSection {
            calendar_url: Some("https://caldav.example.com/calendars/you/tasks/".to_string()),
            username: Some("you".to_string()),
            password: Some("secret".to_string()),
            token: None,
            show_uids: Some(false),
        }),
    };
    let rendered = toml::to_string_pretty(&template)?;
    std::fs::write(&path, rendered)?;
    Ok(path)
}

/// Environments that have a cache directory on disk, sorted
pub fn list_envs() -> Vec<String> {
    let mut envs = Vec::new();
    if let Ok(entries) = std::fs::read_dir(crate::cache::cache_home()) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    envs.push(name);
                }
            }
        }
    }
    if !envs.contains(&DEFAULT_ENV.to_string()) {
        envs.push(DEFAULT_ENV.to_string());
    }
    envs.sort();
    envs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[caldav]
calendar_url = "https://dav.example.com/cal/"
username = "alice"
password = "hunter2"
show_uids = true
"#,
        )
        .unwrap();
        let section = read_config_file(&path).unwrap();
        assert_eq!(
            section.calendar_url.as_deref(),
            Some("https://dav.example.com/cal/")
        );
        assert_eq!(section.username.as_deref(), Some("alice"));
        assert_eq!(section.password.as_deref(), Some("hunter2"));
        assert_eq!(section.show_uids, Some(true));
    }

    #[test]
    fn malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "caldav = 3").unwrap();
        assert!(read_config_file(&path).is_err());
    }

    #[test]
    fn env_names_are_sanitized() {
        assert_eq!(resolve_env(Some("work")), "work");
        assert_eq!(resolve_env(Some("  ")), "default");
        assert!(!resolve_env(Some("../evil")).contains('/'));
    }
}
