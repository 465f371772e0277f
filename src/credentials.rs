//! Database connection parameters, taken either straight from the environment or from a named AWS Secrets
//! Manager secret.

use crate::config::{DB_HOST, DB_NAME, DB_PASSWORD, DB_PORT, DB_SECRET_NAME, DB_USER, DEFAULT_DB_PORT};
use crate::error::{PipelineError, Result};
use aws_config::SdkConfig;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use log::{debug, error, info};
use serde::Deserialize;
use std::env;
use std::fmt;

#[derive(Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Port {
    Number(u16),
    Text(String),
}

/// The connection fields a secret may carry. Anything it leaves out falls back to the environment.
#[derive(Debug, Default, Deserialize)]
struct SecretFields {
    host: Option<String>,
    port: Option<Port>,
    dbname: Option<String>,
    #[serde(alias = "user")]
    username: Option<String>,
    password: Option<String>,
}

impl SecretFields {
    fn into_db_config<F>(self, lookup: F) -> Result<DbConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match self.port {
            Some(Port::Number(port)) => port,
            Some(Port::Text(port)) => parse_port(&port)?,
            None => lookup(DB_PORT)
                .map(|port| parse_port(&port))
                .transpose()?
                .unwrap_or(DEFAULT_DB_PORT),
        };

        let host = self.host.or_else(|| lookup(DB_HOST));
        let dbname = self.dbname.or_else(|| lookup(DB_NAME));
        let user = self.username.or_else(|| lookup(DB_USER));
        let password = self.password.or_else(|| lookup(DB_PASSWORD));

        match (host, dbname, user, password) {
            (Some(host), Some(dbname), Some(user), Some(password)) => Ok(DbConfig {
                host,
                port,
                dbname,
                user,
                password,
            }),
            (host, dbname, user, password) => {
                let missing = [
                    ("host", host.is_none()),
                    ("dbname", dbname.is_none()),
                    ("user", user.is_none()),
                    ("password", password.is_none()),
                ]
                .into_iter()
                .filter_map(|(name, missing)| missing.then_some(name))
                .collect::<Vec<_>>();

                Err(PipelineError::Credentials(format!(
                    "Missing database settings: {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

fn parse_port(port: &str) -> Result<u16> {
    port.trim()
        .parse()
        .map_err(|e| PipelineError::Credentials(format!("Invalid database port '{port}': {e}")))
}

fn env_lookup(name: &str) -> Option<String> {
    env::var(name).ok()
}

/// Where database credentials come from. Chosen once at startup and resolved each time a session opens.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    Environment,
    SecretsManager {
        client: aws_sdk_secretsmanager::Client,
        secret_name: String,
    },
}

impl CredentialSource {
    /// Uses the secret named by `DB_SECRET_NAME` when that is set, the plain environment otherwise.
    pub fn from_env(aws_config: &SdkConfig) -> Self {
        match env_lookup(DB_SECRET_NAME).filter(|name| !name.trim().is_empty()) {
            Some(secret_name) => Self::SecretsManager {
                client: aws_sdk_secretsmanager::Client::new(aws_config),
                secret_name,
            },
            None => Self::Environment,
        }
    }

    pub async fn resolve(&self) -> Result<DbConfig> {
        self.resolve_with(env_lookup).await
    }

    async fn resolve_with<F>(&self, lookup: F) -> Result<DbConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = match self {
            Self::Environment => {
                info!("Using database credentials from environment variables");
                SecretFields::default().into_db_config(lookup)
            }
            Self::SecretsManager {
                client,
                secret_name,
            } => {
                info!("Retrieving database credentials from Secrets Manager: {secret_name}");
                fetch_secret(client, secret_name)
                    .await
                    .and_then(|fields| fields.into_db_config(lookup))
            }
        };

        match config {
            Ok(config) => {
                debug!("Database config: {config:?}");
                Ok(config)
            }
            Err(e) => {
                error!("{e}");
                Err(e)
            }
        }
    }
}

async fn fetch_secret(
    client: &aws_sdk_secretsmanager::Client,
    secret_name: &str,
) -> Result<SecretFields> {
    let output = client
        .get_secret_value()
        .secret_id(secret_name)
        .send()
        .await
        .map_err(|e| {
            PipelineError::Credentials(format!(
                "Error retrieving secret {secret_name}: {}",
                DisplayErrorContext(&e)
            ))
        })?;

    let secret = output.secret_string().ok_or_else(|| {
        PipelineError::Credentials(format!("Secret {secret_name} has no SecretString"))
    })?;

    serde_json::from_str(secret).map_err(|e| {
        PipelineError::Credentials(format!("Secret {secret_name} is not valid JSON: {e}"))
    })
}
