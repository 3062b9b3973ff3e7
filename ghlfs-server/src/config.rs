use std::time::Duration;

use ghlfs_common::RepositoryIdentifier;

use crate::{proxy::DEFAULT_PROXY_TIMEOUT, transfer::TransferMode};

pub struct Config {
    pub listen_addr: (String, u16),
    pub base_url: String,
    pub s3_client: aws_sdk_s3::Client,
    pub s3_bucket: String,
    pub github: GitHubConfig,
    pub oidc: Option<OidcConfig>,
    pub transfer_mode: TransferMode,
    pub proxy_timeout: Duration,
    pub secure_cookies: bool,
}

pub struct GitHubConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Never empty; the first entry is where logins return to by default.
    pub redirect_uris: Vec<String>,
}

pub struct OidcConfig {
    pub audience: String,
    pub allowed_repositories: Vec<RepositoryIdentifier>,
}

impl Config {
    pub fn load() -> Result<Self, String> {
        let env = match Env::load() {
            Ok(env) => env,
            Err(e) => return Err(format!("failed to load configuration: {e}")),
        };

        let s3_client = match create_s3_client(&env) {
            Ok(s3_client) => s3_client,
            Err(e) => return Err(format!("failed to create S3 client: {e}")),
        };
        let client_secret = match read_secret(&env.github_client_secret_file) {
            Ok(secret) => secret,
            Err(e) => return Err(format!("failed to read GitHub client secret: {e}")),
        };

        let base_url = env.base_url.trim_end_matches('/').to_string();
        let Ok(listen_port): Result<u16, _> = env.listen_port.parse() else {
            return Err("configured GHLFS_LISTEN_PORT is invalid".to_string());
        };

        let redirect_uris = split_list(&env.oauth_redirect_uris);
        if redirect_uris.is_empty() {
            return Err("configured GHLFS_OAUTH_REDIRECT_URIS is empty".to_string());
        }

        let oidc = match env.oidc_audience {
            Some(audience) if !audience.is_empty() => {
                let allowed_repositories = split_list(&env.oidc_allowed_repositories)
                    .iter()
                    .map(|r| r.parse())
                    .collect::<Result<Vec<RepositoryIdentifier>, _>>()
                    .map_err(|_| {
                        "configured GHLFS_OIDC_ALLOWED_REPOSITORIES is invalid".to_string()
                    })?;
                Some(OidcConfig {
                    audience,
                    allowed_repositories,
                })
            }
            _ => None,
        };

        let transfer_mode = match env.transfer_mode.as_deref() {
            None | Some("") | Some("presigned") => TransferMode::Presigned,
            Some("proxy") => TransferMode::Proxy,
            Some(_) => return Err("configured GHLFS_TRANSFER_MODE is invalid".to_string()),
        };
        let proxy_timeout = match env.proxy_timeout_secs.as_deref() {
            None | Some("") => DEFAULT_PROXY_TIMEOUT,
            Some(secs) => match secs.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => return Err("configured GHLFS_PROXY_TIMEOUT_SECS is invalid".to_string()),
            },
        };
        let secure_cookies = match env.secure_cookies.as_deref() {
            None | Some("") | Some("true") => true,
            Some("false") => false,
            Some(_) => return Err("configured GHLFS_SECURE_COOKIES is invalid".to_string()),
        };

        Ok(Self {
            listen_addr: (env.listen_host, listen_port),
            base_url,
            s3_client,
            s3_bucket: env.s3_bucket,
            github: GitHubConfig {
                client_id: env.github_client_id,
                client_secret,
                redirect_uris,
            },
            oidc,
            transfer_mode,
            proxy_timeout,
            secure_cookies,
        })
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}

fn read_secret(path: &str) -> Result<String, std::io::Error> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

fn create_s3_client(env: &Env) -> Result<aws_sdk_s3::Client, std::io::Error> {
    let access_key_id = read_secret(&env.s3_access_key_id)?;
    let secret_access_key = read_secret(&env.s3_secret_access_key)?;

    let credentials = aws_sdk_s3::config::Credentials::new(
        access_key_id,
        secret_access_key,
        None,
        None,
        "ghlfs-env",
    );
    let config = aws_config::SdkConfig::builder()
        .behavior_version(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(env.s3_region.clone()))
        .endpoint_url(&env.s3_endpoint)
        .credentials_provider(aws_sdk_s3::config::SharedCredentialsProvider::new(
            credentials,
        ))
        .build();
    Ok(aws_sdk_s3::Client::new(&config))
}

struct Env {
    s3_access_key_id: String,
    s3_secret_access_key: String,
    s3_bucket: String,
    s3_region: String,
    s3_endpoint: String,
    base_url: String,
    listen_host: String,
    listen_port: String,
    github_client_id: String,
    github_client_secret_file: String,
    oauth_redirect_uris: String,
    oidc_audience: Option<String>,
    oidc_allowed_repositories: String,
    transfer_mode: Option<String>,
    proxy_timeout_secs: Option<String>,
    secure_cookies: Option<String>,
}

impl Env {
    fn load() -> Result<Env, String> {
        Ok(Env {
            s3_secret_access_key: require_env("GHLFS_S3_SECRET_ACCESS_KEY_FILE")?,
            s3_access_key_id: require_env("GHLFS_S3_ACCESS_KEY_ID_FILE")?,
            s3_region: require_env("GHLFS_S3_REGION")?,
            s3_endpoint: require_env("GHLFS_S3_ENDPOINT")?,
            s3_bucket: require_env("GHLFS_S3_BUCKET")?,
            base_url: require_env("GHLFS_BASE_URL")?,
            listen_host: require_env("GHLFS_LISTEN_HOST")?,
            listen_port: require_env("GHLFS_LISTEN_PORT")?,
            github_client_id: require_env("GHLFS_GITHUB_CLIENT_ID")?,
            github_client_secret_file: require_env("GHLFS_GITHUB_CLIENT_SECRET_FILE")?,
            oauth_redirect_uris: require_env("GHLFS_OAUTH_REDIRECT_URIS")?,
            oidc_audience: std::env::var("GHLFS_OIDC_AUDIENCE").ok(),
            oidc_allowed_repositories: std::env::var("GHLFS_OIDC_ALLOWED_REPOSITORIES")
                .unwrap_or_default(),
            transfer_mode: std::env::var("GHLFS_TRANSFER_MODE").ok(),
            proxy_timeout_secs: std::env::var("GHLFS_PROXY_TIMEOUT_SECS").ok(),
            secure_cookies: std::env::var("GHLFS_SECURE_COOKIES").ok(),
        })
    }
}

fn require_env(name: &str) -> Result<String, String> {
    std::env::var(name)
        .map_err(|_| format!("environment variable {name} should be defined and valid"))
}
