//! YAML configuration for connections and mirrored tables
//!
//! ```yaml
//! connections:
//!   - name: main
//!     host: localhost
//!     database: app
//!     username: app
//!     password_env: PGMIRROR_PASSWORD
//! tables:
//!   - connection: main
//!     schema: public
//!     table: users
//!     policy: replay_newer
//!     fields:
//!       - { name: login, type: string, required: true }
//!       - { name: age, type: integer }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::connector::{ConnectionParams, DEFAULT_CHANNEL, DEFAULT_PORT};
use crate::mirror::ReconcilePolicy;
use crate::schema::{FieldDescriptor, TableDescriptor};
use pgmirror_api::IDENTITY_FIELD;

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    #[serde(default)]
    pub username: String,
    /// Plain password, for local setups
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default = "default_channel")]
    pub channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub connection: String,
    pub schema: String,
    pub table: String,
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
    #[serde(default)]
    pub policy: ReconcilePolicy,
    /// Reject inserts and updates that leave required fields empty
    #[serde(default)]
    pub validate_required: bool,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_channel() -> String {
    DEFAULT_CHANNEL.to_string()
}

fn default_identity_field() -> String {
    IDENTITY_FIELD.to_string()
}

impl MirrorConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: MirrorConfig =
            serde_yaml::from_str(content).context("Failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for conn in &self.connections {
            if !seen.insert(conn.name.as_str()) {
                bail!("connection {} is defined twice", conn.name);
            }
        }
        for table in &self.tables {
            if !seen.contains(table.connection.as_str()) {
                bail!(
                    "table {}.{} uses unknown connection {}",
                    table.schema,
                    table.table,
                    table.connection
                );
            }
        }
        Ok(())
    }

    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.iter().find(|c| c.name == name)
    }
}

impl ConnectionConfig {
    /// Password from `password_env` if set, else the inline one
    pub fn resolve_password(&self) -> Result<String> {
        match (&self.password_env, &self.password) {
            (Some(var), _) => std::env::var(var)
                .with_context(|| format!("Password variable {} is not set", var)),
            (None, Some(password)) => Ok(password.clone()),
            (None, None) => Ok(String::new()),
        }
    }

    pub fn params(&self) -> ConnectionParams {
        ConnectionParams::new(&self.host, self.port, &self.database).with_channel(&self.channel)
    }
}

impl TableConfig {
    pub fn descriptor(&self) -> TableDescriptor {
        TableDescriptor::new(&self.schema, &self.table)
            .with_identity_field(&self.identity_field)
            .with_fields(self.fields.iter().cloned())
    }
}
