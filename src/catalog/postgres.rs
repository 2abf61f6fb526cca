// ABOUTME: Catalog backend over a direct tokio-postgres connection
// ABOUTME: TLS via native-tls when the profile asks for SSL, mirroring libpq's sslmode=require

use std::time::Duration;

use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, NoTls};
use tracing::warn;

use super::{
    row_count_query, CatalogReader, DATABASE_SIZE_QUERY, SCHEMAS_QUERY, TABLES_QUERY,
    VERSION_QUERY,
};
use crate::error::{EngineError, Result};
use crate::ident::QualifiedName;
use crate::models::{ConnectionProfile, DatabaseInfo, DatabaseStructure, SchemaInfo, TableInfo};

#[derive(Debug, Clone, Default)]
pub struct PostgresCatalog;

impl PostgresCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn client_config(profile: &ConnectionProfile) -> Config {
        let mut config = Config::new();
        config
            .host(&profile.host)
            .port(profile.port)
            .dbname(&profile.database)
            .user(&profile.user)
            .application_name("pgclone")
            .connect_timeout(Duration::from_secs(30))
            .options("-c default_transaction_read_only=on")
            .ssl_mode(if profile.ssl {
                SslMode::Require
            } else {
                SslMode::Prefer
            });
        if !profile.password.is_empty() {
            config.password(&profile.password);
        }
        config
    }

    async fn connect(&self, profile: &ConnectionProfile) -> Result<Client> {
        let config = Self::client_config(profile);
        let location = profile.location();

        if profile.ssl {
            // sslmode=require encrypts but does not verify the certificate.
            let connector = TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| EngineError::catalog(format!("Failed to build TLS connector: {}", e)))?;
            let (client, connection) = config
                .connect(MakeTlsConnector::new(connector))
                .await
                .map_err(|e| connect_error(&location, e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "Catalog connection closed with error");
                }
            });
            Ok(client)
        } else {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| connect_error(&location, e))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "Catalog connection closed with error");
                }
            });
            Ok(client)
        }
    }
}

fn connect_error(location: &str, err: tokio_postgres::Error) -> EngineError {
    EngineError::catalog(format!("Failed to connect to {}: {}", location, err))
}

fn query_error(err: tokio_postgres::Error) -> EngineError {
    EngineError::catalog(err.to_string())
}

async fn read_structure(client: &Client) -> Result<DatabaseStructure> {
    let schemas = client
        .query(SCHEMAS_QUERY, &[])
        .await
        .map_err(query_error)?
        .iter()
        .map(|row| SchemaInfo {
            name: row.get(0),
            table_count: row.get(1),
        })
        .collect();
    let tables = client
        .query(TABLES_QUERY, &[])
        .await
        .map_err(query_error)?
        .iter()
        .map(|row| TableInfo {
            schema: row.get(0),
            name: row.get(1),
            row_count: row.get(2),
            size: row.get(3),
        })
        .collect();
    Ok(DatabaseStructure { schemas, tables })
}

#[async_trait]
impl CatalogReader for PostgresCatalog {
    async fn read_structure(&self, profile: &ConnectionProfile) -> Result<DatabaseStructure> {
        let client = self.connect(profile).await?;
        read_structure(&client).await
    }

    async fn probe(&self, profile: &ConnectionProfile) -> Result<DatabaseInfo> {
        let client = self.connect(profile).await?;
        let version: String = client
            .query_one(VERSION_QUERY, &[])
            .await
            .map_err(query_error)?
            .get(0);
        let total_size: i64 = client
            .query_one(DATABASE_SIZE_QUERY, &[])
            .await
            .map_err(query_error)?
            .get(0);
        let structure = read_structure(&client).await?;
        Ok(DatabaseInfo {
            version,
            total_size,
            tables: structure.tables,
        })
    }

    async fn exact_row_counts(
        &self,
        profile: &ConnectionProfile,
        tables: &[QualifiedName],
    ) -> Result<Vec<(QualifiedName, i64)>> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.connect(profile).await?;
        let rows = client
            .query(row_count_query(tables).as_str(), &[])
            .await
            .map_err(query_error)?;
        Ok(tables
            .iter()
            .cloned()
            .zip(rows.iter().map(|row| row.get::<_, i64>(1)))
            .collect())
    }
}
