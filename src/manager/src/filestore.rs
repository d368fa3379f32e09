//! Scrape-config file store.
//!
//! One YAML file per snapshot in the directory watched by vmagent. The file
//! name stem is the snapshot id, and so is the job name inside the file.
//! Writes go through a temp file and a rename so the agent never observes a
//! partially written config.

use std::fs::FileTimes;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use common::ApiError;

use crate::model::{ConfigType, DisplaySnapshot, SnapshotRequest};

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("unsupported agent type: {0}, only vmagent is supported")]
    UnsupportedAgent(String),
    #[error("config file does not exist for snapshot {0}")]
    NotFound(String),
    #[error("invalid config file for snapshot {0}")]
    Invalid(String),
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config file encoding failed: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<FileStoreError> for ApiError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::NotFound(msg) => {
                ApiError::NotFound(format!("config file does not exist for snapshot {msg}"))
            }
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BasicAuth {
    username: String,
    password: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HttpSdConfig {
    url: String,
    basic_auth: BasicAuth,
}

#[derive(Debug, Serialize, Deserialize)]
struct StaticConfig {
    targets: Vec<String>,
}

/// A single vmagent scrape job. The generated file holds a list with one
/// entry whose `job_name` is the snapshot id.
#[derive(Debug, Serialize, Deserialize)]
struct ScrapeJob {
    job_name: String,
    basic_auth: BasicAuth,
    scheme: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    http_sd_configs: Vec<HttpSdConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    static_configs: Vec<StaticConfig>,
}

pub struct FileStore {
    directory: PathBuf,
}

impl FileStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path(&self, id: &str) -> PathBuf {
        self.directory.join(format!("{id}.yml"))
    }

    /// Write a scrape-config file for the request and return the generated
    /// snapshot id.
    pub async fn save(
        &self,
        request: &SnapshotRequest,
        agent_type: &str,
    ) -> Result<String, FileStoreError> {
        if !agent_type.eq_ignore_ascii_case("vmagent") {
            return Err(FileStoreError::UnsupportedAgent(agent_type.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let job = build_vmagent_job(&id, request);
        let content = serde_yaml::to_string(&vec![job])?;

        let tmp = self.directory.join(format!("{id}.yml.tmp"));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, self.path(&id)).await?;

        Ok(id)
    }

    /// Parse the file back into the display view.
    pub async fn get(&self, id: &str) -> Result<DisplaySnapshot, FileStoreError> {
        let path = self.path(id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileStoreError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let jobs: Vec<ScrapeJob> = serde_yaml::from_str(&content)?;
        let job = jobs
            .into_iter()
            .next()
            .ok_or_else(|| FileStoreError::Invalid(id.to_string()))?;

        let modified = tokio::fs::metadata(&path).await?.modified()?;

        Ok(DisplaySnapshot {
            name: job.job_name,
            urls: job.http_sd_configs.into_iter().map(|c| c.url).collect(),
            targets: job
                .static_configs
                .into_iter()
                .flat_map(|c| c.targets)
                .collect(),
            timestamp: DateTime::<Utc>::from(modified),
        })
    }

    pub async fn delete(&self, id: &str) -> Result<(), FileStoreError> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(FileStoreError::NotFound(id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Heartbeat: bump the file's atime/mtime to now without touching its
    /// content.
    pub async fn touch(&self, id: &str) -> Result<(), FileStoreError> {
        let path = self.path(id);
        let file = match std::fs::OpenOptions::new().append(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileStoreError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        let now = SystemTime::now();
        file.set_times(FileTimes::new().set_accessed(now).set_modified(now))?;
        Ok(())
    }
}

fn build_vmagent_job(id: &str, request: &SnapshotRequest) -> ScrapeJob {
    let scheme = if request.scheme.is_empty() {
        "http"
    } else {
        request.scheme.as_str()
    };
    let auth = || BasicAuth {
        username: request.credentials.username.clone(),
        password: request.credentials.password.clone(),
    };

    let mut http_sd_configs = Vec::new();
    let mut static_configs = Vec::new();
    for config in &request.configs {
        match config.kind {
            ConfigType::Sd => {
                for host in &config.hostnames {
                    http_sd_configs.push(HttpSdConfig {
                        url: format!(
                            "{scheme}://{host}:{port}/prometheus_sd_config?port=insecure",
                            port = config.port
                        ),
                        basic_auth: auth(),
                    });
                }
            }
            ConfigType::Static => {
                static_configs.push(StaticConfig {
                    targets: config
                        .hostnames
                        .iter()
                        .map(|host| format!("{host}:{}", config.port))
                        .collect(),
                });
            }
        }
    }

    ScrapeJob {
        job_name: id.to_string(),
        basic_auth: auth(),
        scheme: scheme.to_string(),
        http_sd_configs,
        static_configs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConfigObject, Credentials};
    use tempfile::TempDir;

    fn request(scheme: &str) -> SnapshotRequest {
        SnapshotRequest {
            configs: vec![
                ConfigObject {
                    hostnames: vec!["h1".to_string(), "h2".to_string()],
                    kind: ConfigType::Sd,
                    port: 8091,
                },
                ConfigObject {
                    hostnames: vec!["h3".to_string()],
                    kind: ConfigType::Static,
                    port: 9100,
                },
            ],
            credentials: Credentials {
                username: "Administrator".to_string(),
                password: "password".to_string(),
            },
            scheme: scheme.to_string(),
            label: None,
        }
    }

    #[tokio::test]
    async fn test_save_then_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let id = store.save(&request("https"), "vmagent").await.unwrap();
        assert!(dir.path().join(format!("{id}.yml")).exists());

        let view = store.get(&id).await.unwrap();
        assert_eq!(view.name, id);
        assert_eq!(
            view.urls,
            vec![
                "https://h1:8091/prometheus_sd_config?port=insecure",
                "https://h2:8091/prometheus_sd_config?port=insecure",
            ]
        );
        assert_eq!(view.targets, vec!["h3:9100"]);
    }

    #[tokio::test]
    async fn test_job_name_matches_file_stem() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let id = store.save(&request(""), "vmagent").await.unwrap();
        let content = std::fs::read_to_string(dir.path().join(format!("{id}.yml"))).unwrap();
        let jobs: Vec<ScrapeJob> = serde_yaml::from_str(&content).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_name, id);
        // default scheme
        assert_eq!(jobs[0].scheme, "http");
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let _id = store.save(&request("http"), "vmagent").await.unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_agent_type() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let err = store.save(&request("http"), "prometheus").await.unwrap_err();
        assert!(matches!(err, FileStoreError::UnsupportedAgent(_)));
    }

    #[tokio::test]
    async fn test_get_and_delete_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        assert!(matches!(
            store.get("nope").await,
            Err(FileStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("nope").await,
            Err(FileStoreError::NotFound(_))
        ));
        assert!(matches!(
            store.touch("nope").await,
            Err(FileStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_touch_bumps_mtime() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let id = store.save(&request("http"), "vmagent").await.unwrap();
        let before = SystemTime::now();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        store.touch(&id).await.unwrap();

        let mtime = std::fs::metadata(dir.path().join(format!("{id}.yml")))
            .unwrap()
            .modified()
            .unwrap();
        assert!(mtime >= before);
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let id = store.save(&request("http"), "vmagent").await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(!dir.path().join(format!("{id}.yml")).exists());
        assert!(matches!(
            store.get(&id).await,
            Err(FileStoreError::NotFound(_))
        ));
    }
}
