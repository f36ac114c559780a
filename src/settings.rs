//! Config file surface consumed by the core.
//!
//! The file is TOML with `[runner]` and `[proxy]` tables. Endpoint specs are
//! strings like `ipc:/run/relayd/server-in` or `tcp://127.0.0.1:5560`; a
//! `{ipc_prefix}` placeholder inside a spec is substituted from
//! `runner.ipc_prefix` (or the `--ipc-prefix` command line override) before
//! anything else sees it.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::SetupError;

fn default_client_maxconn() -> i64 {
    50000
}

fn default_workers() -> usize {
    1
}

fn default_max_open_requests() -> i64 {
    -1
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    #[serde(default = "default_client_maxconn")]
    pub client_maxconn: i64,
    pub ipc_prefix: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            client_maxconn: default_client_maxconn(),
            ipc_prefix: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Cap on concurrently open proxied requests; `-1` means "use
    /// `runner.client_maxconn`". Always clamped to `client_maxconn`.
    #[serde(default = "default_max_open_requests")]
    pub max_open_requests: i64,
    /// Routes file path; relative paths resolve against the config file's
    /// directory.
    pub routesfile: Option<String>,
    pub ipc_file_mode: Option<u32>,
    pub debug: bool,

    pub server_in_specs: Vec<String>,
    pub server_in_stream_specs: Vec<String>,
    pub server_out_specs: Vec<String>,
    pub client_out_specs: Vec<String>,
    pub client_out_stream_specs: Vec<String>,
    pub client_in_specs: Vec<String>,

    pub inspect_spec: Option<String>,
    pub accept_spec: Option<String>,
    pub retry_in_spec: Option<String>,
    pub ws_control_init_specs: Vec<String>,
    pub ws_control_stream_specs: Vec<String>,
    pub stats_spec: Option<String>,
    pub command_spec: Option<String>,
    pub intreq_in_specs: Vec<String>,
    pub intreq_in_stream_specs: Vec<String>,
    pub intreq_out_specs: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_open_requests: default_max_open_requests(),
            routesfile: None,
            ipc_file_mode: None,
            debug: false,
            server_in_specs: Vec::new(),
            server_in_stream_specs: Vec::new(),
            server_out_specs: Vec::new(),
            client_out_specs: Vec::new(),
            client_out_stream_specs: Vec::new(),
            client_in_specs: Vec::new(),
            inspect_spec: None,
            accept_spec: None,
            retry_in_spec: None,
            ws_control_init_specs: Vec::new(),
            ws_control_stream_specs: Vec::new(),
            stats_spec: None,
            command_spec: None,
            intreq_in_specs: Vec::new(),
            intreq_in_stream_specs: Vec::new(),
            intreq_out_specs: Vec::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub runner: RunnerSettings,
    pub proxy: ProxySettings,
}

fn trimmed(list: &mut Vec<String>) {
    list.retain(|s| !s.is_empty());
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Settings, SetupError> {
        let text = fs::read_to_string(path).map_err(|e| {
            SetupError::Config(format!("failed to open {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Settings, SetupError> {
        let mut settings: Settings = toml::from_str(text)
            .map_err(|e| SetupError::Config(format!("invalid config: {}", e)))?;
        settings.for_each_spec_list(trimmed);
        Ok(settings)
    }

    fn for_each_spec_list(&mut self, f: impl Fn(&mut Vec<String>)) {
        let p = &mut self.proxy;
        for list in [
            &mut p.server_in_specs,
            &mut p.server_in_stream_specs,
            &mut p.server_out_specs,
            &mut p.client_out_specs,
            &mut p.client_out_stream_specs,
            &mut p.client_in_specs,
            &mut p.ws_control_init_specs,
            &mut p.ws_control_stream_specs,
            &mut p.intreq_in_specs,
            &mut p.intreq_in_stream_specs,
            &mut p.intreq_out_specs,
        ] {
            f(list);
        }
    }

    /// Substitutes `{ipc_prefix}` in every spec. `override_prefix` (from the
    /// command line) wins over `runner.ipc_prefix`.
    pub fn apply_ipc_prefix(&mut self, override_prefix: Option<&str>) {
        let prefix = override_prefix
            .map(str::to_string)
            .or_else(|| self.runner.ipc_prefix.clone())
            .unwrap_or_default();

        let sub = |s: &mut String| {
            if s.contains("{ipc_prefix}") {
                *s = s.replace("{ipc_prefix}", &prefix);
            }
        };
        self.for_each_spec_list(|list| list.iter_mut().for_each(&sub));
        let p = &mut self.proxy;
        for spec in [
            &mut p.inspect_spec,
            &mut p.accept_spec,
            &mut p.retry_in_spec,
            &mut p.stats_spec,
            &mut p.command_spec,
        ]
        .into_iter()
        .flatten()
        {
            sub(spec);
        }
    }

    /// The server-facing and client-facing spec groups must each be fully
    /// set; the engine cannot come up without them.
    pub fn validate(&self) -> Result<(), SetupError> {
        let p = &self.proxy;
        if p.server_in_specs.is_empty()
            || p.server_in_stream_specs.is_empty()
            || p.server_out_specs.is_empty()
        {
            return Err(SetupError::Config(
                "must set server_in_specs, server_in_stream_specs, and server_out_specs"
                    .to_string(),
            ));
        }
        if p.client_out_specs.is_empty()
            || p.client_out_stream_specs.is_empty()
            || p.client_in_specs.is_empty()
        {
            return Err(SetupError::Config(
                "must set client_out_specs, client_out_stream_specs, and client_in_specs"
                    .to_string(),
            ));
        }
        if p.workers == 0 {
            return Err(SetupError::Config("workers must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Total session budget across all workers: `max_open_requests` clamped
    /// to `client_maxconn`, or `client_maxconn` when unset.
    pub fn sessions_max(&self) -> usize {
        let maxconn = self.runner.client_maxconn.max(0);
        let requested = self.proxy.max_open_requests;
        let effective = if requested >= 0 {
            requested.min(maxconn)
        } else {
            maxconn
        };
        effective as usize
    }

    /// Routes file resolved against the config file's directory when
    /// relative.
    pub fn routes_file(&self, config_dir: &Path) -> Option<PathBuf> {
        let f = self.proxy.routesfile.as_ref()?;
        let p = PathBuf::from(f);
        if p.is_relative() {
            Some(config_dir.join(p))
        } else {
            Some(p)
        }
    }
}
