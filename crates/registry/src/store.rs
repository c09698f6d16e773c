//! Durable storage for service records.
//!
//! Anything transactional with unique-by-ip semantics works; the shipped
//! implementation is PostgreSQL behind a small bb8 pool. Credentials are
//! JSON-encoded into a single column, the schema the admin tooling already
//! understands.

use async_trait::async_trait;
use bb8::Pool;
use tokio_postgres::{Config as PgConfig, NoTls};
use tracing::{error, info};

use crate::{Error, Result, Service};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS services(\
    ip VARCHAR(255) PRIMARY KEY, \
    service_type INT NOT NULL, \
    auth_type INT NOT NULL, \
    auth VARCHAR(4096) NOT NULL)";

#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Create the backing table when it does not exist yet.
    async fn ensure_schema(&self) -> Result<()>;

    async fn list(&self) -> Result<Vec<Service>>;

    /// Insert or replace the record for `service.ip`.
    async fn add(&self, service: &Service) -> Result<()>;

    async fn delete(&self, ip: &str) -> Result<()>;
}

pub type PgPool = Pool<PgConnectionManager>;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Build the pool and run a one-time connectivity check so bad
    /// credentials surface at startup rather than on the first command.
    pub async fn connect(database_url: &str, max_pool_size: u32) -> Result<Self> {
        let manager = PgConnectionManager::new(database_url)?;
        let pool = Pool::builder()
            .max_size(max_pool_size)
            .build(manager)
            .await
            .map_err(|err| Error::Pool(err.to_string()))?;

        match pool.get().await {
            Ok(_) => info!("registry database connectivity check succeeded"),
            Err(err) => error!(error = %err, "initial registry database connectivity check failed"),
        }

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<bb8::PooledConnection<'_, PgConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|err| Error::Pool(err.to_string()))
    }
}

#[async_trait]
impl ServiceStore for PgStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.conn().await?.batch_execute(SCHEMA).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Service>> {
        let conn = self.conn().await?;
        let rows = conn
            .query("SELECT service_type, ip, auth_type, auth FROM services", &[])
            .await?;

        let mut services = Vec::with_capacity(rows.len());
        for row in rows {
            let service_type: i32 = row.get(0);
            let ip: String = row.get(1);
            let auth_type: i32 = row.get(2);
            let auth: String = row.get(3);
            services.push(Service {
                service_type: service_type.try_into().map_err(|reason| {
                    Error::InvalidService {
                        ip: ip.clone(),
                        reason,
                    }
                })?,
                auth_type: auth_type.try_into().map_err(|reason| {
                    Error::InvalidService {
                        ip: ip.clone(),
                        reason,
                    }
                })?,
                auth: serde_json::from_str(&auth)?,
                ip,
            });
        }
        Ok(services)
    }

    async fn add(&self, service: &Service) -> Result<()> {
        let auth = serde_json::to_string(&service.auth)?;
        self.conn()
            .await?
            .execute(
                "INSERT INTO services(ip, service_type, auth_type, auth) \
                 VALUES($1, $2, $3, $4) \
                 ON CONFLICT (ip) DO UPDATE SET \
                 service_type = EXCLUDED.service_type, \
                 auth_type = EXCLUDED.auth_type, \
                 auth = EXCLUDED.auth",
                &[
                    &service.ip,
                    &i32::from(service.service_type),
                    &i32::from(service.auth_type),
                    &auth,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete(&self, ip: &str) -> Result<()> {
        self.conn()
            .await?
            .execute("DELETE FROM services WHERE ip = $1", &[&ip])
            .await?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct PgConnectionManager {
    config: PgConfig,
}

impl PgConnectionManager {
    fn new(database_url: &str) -> Result<Self> {
        let config = database_url
            .parse::<PgConfig>()
            .map_err(|err| Error::Pool(format!("invalid database url: {err}")))?;
        Ok(Self { config })
    }
}

#[async_trait]
impl bb8::ManageConnection for PgConnectionManager {
    type Connection = tokio_postgres::Client;
    type Error = tokio_postgres::Error;

    async fn connect(&self) -> std::result::Result<Self::Connection, Self::Error> {
        let (client, connection) = self.config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "registry database connection task ended");
            }
        });
        Ok(client)
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> std::result::Result<(), Self::Error> {
        conn.batch_execute("SELECT 1").await
    }

    fn has_broken(&self, _: &mut Self::Connection) -> bool {
        false
    }
}
