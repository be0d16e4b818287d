use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::*;

pub const CONFIG_FILE: &str = ".grape/config";
pub const STATS_FILE: &str = ".grape/stats";
pub const HIDDEN_PREFIX: &str = "_";

/// Project configuration stored as a JSON object and addressed with dotted
/// keys such as `genomes.male.path`.
#[derive(Debug, Clone)]
pub struct Config {
    file: Option<PathBuf>,
    stats_file: Option<PathBuf>,
    data: Value,
    stats: Value,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_value(Value::Object(Map::new()))
    }
}

impl Config {
    /// Load the configuration of the project at `project`, writing the
    /// default configuration when none exists yet.
    pub fn open(project: impl AsRef<Path>) -> Result<Self> {
        let project = project.as_ref();
        let file = project.join(CONFIG_FILE);
        let stats_file = project.join(STATS_FILE);

        if file.exists() {
            let data = read_json(&file)?;
            let stats = if stats_file.exists() {
                read_json(&stats_file)?
            } else {
                Value::Object(Map::new())
            };

            return Ok(Self {
                file: Some(file),
                stats_file: Some(stats_file),
                data,
                stats,
            });
        }

        let mut res = Self {
            file: Some(file),
            stats_file: Some(stats_file),
            data: Value::Object(Map::new()),
            stats: Value::Object(Map::new()),
        };
        res.init_default();
        res.save()?;
        Ok(res)
    }

    /// An in-memory configuration that is never written.
    pub fn from_value(data: Value) -> Self {
        Self {
            file: None,
            stats_file: None,
            data,
            stats: Value::Object(Map::new()),
        }
    }

    fn init_default(&mut self) {
        for (k, v) in [
            ("name", "Default project"),
            ("genome", ""),
            ("index", ""),
            ("annotation", ""),
            ("quality", ""),
        ] {
            self.set(k, v);
        }

        if let Value::Object(stats) = &mut self.stats {
            let user = std::env::var("USER").unwrap_or_default();
            stats.insert("user".to_owned(), Value::String(user));
            stats.insert(
                "date".to_owned(),
                Value::String(chrono::Local::now().date_naive().to_string()),
            );
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(file) = &self.file {
            write_json(file, &self.data)?;
        }
        if let Some(stats_file) = &self.stats_file {
            write_json(stats_file, &self.stats)?;
        }
        Ok(())
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn stats(&self) -> &Value {
        &self.stats
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.').try_fold(&self.data, |d, k| d.get(k))
    }

    /// String form of a scalar value. Arrays are joined with `,`.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(value_to_string)
    }

    /// Set `key`, creating intermediate objects. A comma separated value is
    /// stored as an array.
    pub fn set(&mut self, key: &str, value: &str) {
        let keys = key.split('.').collect::<Vec<_>>();
        let Some((last, parents)) = keys.split_last() else {
            return;
        };

        let mut d = &mut self.data;
        for k in parents {
            if !d.is_object() {
                *d = Value::Object(Map::new());
            }
            let Value::Object(map) = d else {
                unreachable!()
            };
            d = map
                .entry(k.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        if !d.is_object() {
            *d = Value::Object(Map::new());
        }
        if let Value::Object(map) = d {
            let values = value.split(',').collect::<Vec<_>>();
            let v = if values.len() == 1 {
                Value::String(value.to_owned())
            } else {
                Value::Array(values.into_iter().map(|s| Value::String(s.to_owned())).collect())
            };
            map.insert(last.to_string(), v);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let (parents, last) = match key.rsplit_once('.') {
            Some((p, l)) => (Some(p), l),
            None => (None, key),
        };

        let parent = match parents {
            Some(p) => p
                .split('.')
                .try_fold(&mut self.data, |d, k| d.get_mut(k))?,
            None => &mut self.data,
        };

        parent.as_object_mut()?.remove(last)
    }

    /// Flatten into dotted `(key, value)` pairs.
    pub fn values(
        &self,
        key: Option<&str>,
        exclude: &[&str],
        show_hidden: bool,
        show_empty: bool,
    ) -> Vec<(String, String)> {
        let root = match key {
            Some(k) => match self.get(k) {
                Some(v) => v,
                None => return Vec::new(),
            },
            None => &self.data,
        };

        let mut res = Vec::new();
        dot_keys(key.unwrap_or_default(), root, exclude, &mut res);

        res.into_iter()
            .filter(|(k, _)| show_hidden || !k.split('.').any(|p| p.starts_with(HIDDEN_PREFIX)))
            .filter(|(_, v)| show_empty || !v.is_empty())
            .collect()
    }
}

fn dot_keys(prefix: &str, value: &Value, exclude: &[&str], res: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if exclude.contains(&k.as_str()) {
                    continue;
                }
                let key = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                dot_keys(&key, v, exclude, res);
            }
        }
        v => res.push((prefix.to_owned(), value_to_string(v).unwrap_or_default())),
    }
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(a) => Some(
            a.iter()
                .filter_map(value_to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Null | Value::Object(_) => None,
    }
}

pub(crate) fn read_json(file: &Path) -> Result<Value> {
    let text = fs::read_to_string(file).map_err(|e| Error::file_io(file, e))?;
    serde_json::from_str(&text).map_err(|e| Error::file_io(file, e))
}

pub(crate) fn write_json(file: &Path, value: &impl Serialize) -> Result<()> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::file_io(parent, e))?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|e| Error::file_io(file, e))?;
    fs::write(file, text).map_err(|e| Error::file_io(file, e))
}

/// Resource and environment settings applied to a job before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub threads: Option<u32>,
    pub max_time: Option<String>,
    pub max_mem: Option<String>,
    pub queue: Option<String>,
    pub priority: Option<String>,
    pub verbose: Option<bool>,
    /// Directories prepended to `PATH` when the tool runs.
    pub modules: Vec<PathBuf>,
}

impl JobConfig {
    /// Overlay `other`; only the values it sets are taken.
    pub fn apply(&mut self, other: &JobConfig) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        overlay!(threads, max_time, max_mem, queue, priority, verbose);

        for m in &other.modules {
            if !self.modules.contains(m) {
                self.modules.push(m.clone());
            }
        }
    }
}

/// Contents of a `jobs.yaml` file: a `default` section plus per tool sections.
pub type JobConfigFile = BTreeMap<String, JobConfig>;

/// How to hand a job script to the cluster scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Program and arguments, which may use `{name}`, `{stdout}`, `{stderr}`
    /// and `{threads}`. The job script path is appended.
    pub submit: Vec<String>,
    /// Argument template for dependencies, `{ids}` is replaced.
    #[serde(default)]
    pub dependency: Option<String>,
    #[serde(default = "default_id_separator")]
    pub id_separator: String,
}

fn default_id_separator() -> String {
    ":".to_owned()
}

/// Global (`$GRAPE_HOME/conf`) and user (`~/.grape`) configuration folders.
#[derive(Debug, Clone, Default)]
pub struct GrapeHome {
    global: Option<PathBuf>,
    user: Option<PathBuf>,
}

impl GrapeHome {
    pub const JOBS_FILE: &'static str = "jobs.yaml";
    pub const CLUSTER_FILE: &'static str = "cluster.yaml";
    pub const DEFAULT_SECTION: &'static str = "default";

    pub fn new(global: Option<PathBuf>, user: Option<PathBuf>) -> Self {
        Self { global, user }
    }

    pub fn from_env() -> Self {
        Self {
            global: std::env::var_os("GRAPE_HOME").map(|h| PathBuf::from(h).join("conf")),
            user: std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".grape")),
        }
    }

    fn load_yaml<T: for<'de> Deserialize<'de>>(dir: Option<&Path>, name: &str) -> Result<Option<T>> {
        let Some(dir) = dir else {
            return Ok(None);
        };
        let file = dir.join(name);
        if !file.exists() {
            return Ok(None);
        }

        let text = fs::read_to_string(&file).map_err(|e| Error::file_io(&file, e))?;
        let res = serde_yaml::from_str(&text).map_err(|e| Error::file_io(&file, e))?;
        Ok(Some(res))
    }

    /// Resolve the configuration for `tool`: global default, global tool,
    /// user default, user tool and finally `overrides`.
    pub fn job_config(&self, tool: &str, overrides: Option<&JobConfig>) -> Result<JobConfig> {
        let global: JobConfigFile =
            Self::load_yaml(self.global.as_deref(), Self::JOBS_FILE)?.unwrap_or_default();
        let user: JobConfigFile =
            Self::load_yaml(self.user.as_deref(), Self::JOBS_FILE)?.unwrap_or_default();

        let mut res = JobConfig::default();
        for file in [&global, &user] {
            for section in [Self::DEFAULT_SECTION, tool] {
                if let Some(cfg) = file.get(section) {
                    res.apply(cfg);
                }
            }
        }
        if let Some(o) = overrides {
            res.apply(o);
        }

        Ok(res)
    }

    /// User cluster configuration, falling back to the global one.
    pub fn cluster_config(&self) -> Result<ClusterConfig> {
        if let Some(cfg) = Self::load_yaml(self.user.as_deref(), Self::CLUSTER_FILE)? {
            return Ok(cfg);
        }
        Self::load_yaml(self.global.as_deref(), Self::CLUSTER_FILE)?.ok_or_else(|| {
            Error::Submission {
                job: String::new(),
                reason: "No cluster configuration found".to_owned(),
            }
        })
    }
}
