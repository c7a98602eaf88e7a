// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<SiltstoneConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

fn default_work_mem_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_spill_dir() -> PathBuf {
    std::env::temp_dir()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static SiltstoneConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = SiltstoneConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

/// Load the config file named by `$SILTSTONE_CONFIG` or `./siltstone.toml`.
/// When neither exists, fall back to built-in defaults.
pub fn init_from_env_or_default() -> Result<&'static SiltstoneConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let cfg = match config_path_from_env() {
        Some(path) => SiltstoneConfig::load_from_file(&path)?,
        None => SiltstoneConfig::default(),
    };
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static SiltstoneConfig> {
    init_from_env_or_default()
}

fn config_path_from_env() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("SILTSTONE_CONFIG") {
        if !p.trim().is_empty() {
            return Some(PathBuf::from(p));
        }
    }

    let candidate = PathBuf::from("siltstone.toml");
    if candidate.exists() {
        return Some(candidate);
    }
    None
}

#[derive(Clone, Deserialize)]
pub struct SiltstoneConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "siltstone=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub exec: ExecConfig,
}

impl SiltstoneConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: SiltstoneConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for SiltstoneConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            exec: ExecConfig::default(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ExecConfig {
    /// Byte budget for the hash table set of one aggregation driver.
    #[serde(default = "default_work_mem_bytes")]
    pub work_mem_bytes: usize,

    /// When true, the hashed strategy ignores the memory and group caps and
    /// never spills.
    #[serde(default)]
    pub hashagg_mem_overflow: bool,

    /// Directory for spill tape files.
    #[serde(default = "default_spill_dir")]
    pub spill_dir: PathBuf,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            work_mem_bytes: default_work_mem_bytes(),
            hashagg_mem_overflow: false,
            spill_dir: default_spill_dir(),
        }
    }
}
