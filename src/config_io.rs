use crate::config::Config;
use std::path::Path;

pub type Result<T> = std::result::Result<T, ConfigIoError>;

#[derive(Debug)]
pub enum ConfigIoError {
    CreateDefault {
        path: String,
        source: Box<ConfigIoError>,
    },
    Read {
        path: String,
        source: std::io::Error,
    },
    ParseToml {
        path: String,
        source: toml::de::Error,
    },
    SerializeToml {
        source: toml::ser::Error,
    },
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    Write {
        path: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CreateDefault { path, .. } => {
                write!(f, "failed to write default config to {path}")
            }
            Self::Read { path, .. } => write!(f, "failed reading config {path}"),
            Self::ParseToml { path, source } => write!(f, "invalid TOML in {path}: {source}"),
            Self::SerializeToml { .. } => write!(f, "failed serializing config"),
            Self::CreateDir { path, .. } => write!(f, "failed creating config directory {path}"),
            Self::Write { path, .. } => write!(f, "failed writing config {path}"),
        }
    }
}

impl std::error::Error for ConfigIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CreateDefault { source, .. } => Some(source.as_ref()),
            Self::Read { source, .. } => Some(source),
            Self::ParseToml { source, .. } => Some(source),
            Self::SerializeToml { source } => Some(source),
            Self::CreateDir { source, .. } => Some(source),
            Self::Write { source, .. } => Some(source),
        }
    }
}

/// Reads `path`, or writes the defaults there and returns them when it does not exist yet.
pub async fn load_or_create_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let display = || path.display().to_string();

    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let cfg = Config::default();
            save_config(path, &cfg)
                .await
                .map_err(|source| ConfigIoError::CreateDefault {
                    path: display(),
                    source: Box::new(source),
                })?;
            tracing::info!(path = %path.display(), "wrote default config");
            return Ok(cfg);
        }
        Err(source) => {
            return Err(ConfigIoError::Read {
                path: display(),
                source,
            });
        }
    };

    toml::from_str(&content).map_err(|source| ConfigIoError::ParseToml {
        path: display(),
        source,
    })
}

/// Writes through a sibling temp file so a crash never leaves a truncated config behind.
pub async fn save_config(path: impl AsRef<Path>, cfg: &Config) -> Result<()> {
    let path = path.as_ref();
    let toml_string =
        toml::to_string_pretty(cfg).map_err(|source| ConfigIoError::SerializeToml { source })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigIoError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
    }

    let tmp = path.with_extension("toml.tmp");
    let write = async {
        tokio::fs::write(&tmp, toml_string).await?;
        tokio::fs::rename(&tmp, path).await
    };
    write.await.map_err(|source| ConfigIoError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_config_is_created_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/config.toml");

        let cfg = load_or_create_config(&path).await.unwrap();
        assert_eq!(cfg.http.bind, "127.0.0.1:5001");
        assert!(path.exists());

        let again = load_or_create_config(&path).await.unwrap();
        assert_eq!(again.stream.end_window_bytes, cfg.stream.end_window_bytes);
    }

    #[tokio::test]
    async fn broken_toml_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[http\nbind = 1").unwrap();
        assert!(matches!(
            load_or_create_config(&path).await,
            Err(ConfigIoError::ParseToml { .. })
        ));
    }
}
