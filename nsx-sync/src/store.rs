use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid record in {table}: {reason}")]
    InvalidRecord { table: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// The backend DHCP server serving a network, keyed by network id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpServiceBinding {
    pub network_id: String,
    /// The DHCP-owned port the server was created for.
    pub port_id: String,
    pub nsx_service_id: String,
    pub created_at: DateTime<Utc>,
}

impl DhcpServiceBinding {
    pub fn new(network_id: &str, port_id: &str, nsx_service_id: &str) -> Self {
        Self {
            network_id: network_id.to_string(),
            port_id: port_id.to_string(),
            nsx_service_id: nsx_service_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// One static binding per (port, IPv4 address).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpBinding {
    pub port_id: String,
    pub subnet_id: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: String,
    pub nsx_service_id: String,
    pub nsx_binding_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Logical switch and logical port backing a tenant port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub port_id: String,
    pub nsx_switch_id: String,
    pub nsx_port_id: String,
}

/// SQLite-backed mapping table between tenant objects and backend objects
pub struct MappingStore {
    pool: SqlitePool,
}

impl MappingStore {
    /// Open (or create) `mappings.db` inside `metadata_dir`.
    pub async fn new(metadata_dir: &str) -> Result<Self> {
        let db_url = format!("sqlite:{}/mappings.db?mode=rwc", metadata_dir);
        Self::connect(&db_url).await
    }

    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dhcp_service_bindings (
                network_id TEXT PRIMARY KEY,
                port_id TEXT NOT NULL,
                nsx_service_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dhcp_bindings (
                port_id TEXT NOT NULL,
                subnet_id TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                mac_address TEXT NOT NULL,
                nsx_service_id TEXT NOT NULL,
                nsx_binding_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (port_id, ip_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_mappings (
                network_id TEXT PRIMARY KEY,
                nsx_switch_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS port_mappings (
                port_id TEXT PRIMARY KEY,
                nsx_switch_id TEXT NOT NULL,
                nsx_port_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // === DHCP service bindings ===

    pub async fn add_dhcp_service_binding(&self, binding: &DhcpServiceBinding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dhcp_service_bindings (network_id, port_id, nsx_service_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(network_id) DO UPDATE SET
                port_id = excluded.port_id,
                nsx_service_id = excluded.nsx_service_id,
                created_at = excluded.created_at
            "#,
        )
        .bind(&binding.network_id)
        .bind(&binding.port_id)
        .bind(&binding.nsx_service_id)
        .bind(binding.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_dhcp_service_binding(
        &self,
        network_id: &str,
    ) -> Result<Option<DhcpServiceBinding>> {
        let row = sqlx::query(
            r#"
            SELECT network_id, port_id, nsx_service_id, created_at
            FROM dhcp_service_bindings WHERE network_id = ?
            "#,
        )
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_service_binding(&r)).transpose()
    }

    pub async fn delete_dhcp_service_binding(&self, network_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dhcp_service_bindings WHERE network_id = ?")
            .bind(network_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // === DHCP bindings ===

    /// Insert a binding, replacing any row for the same (port, ip).
    pub async fn add_dhcp_binding(&self, binding: &DhcpBinding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dhcp_bindings (port_id, subnet_id, ip_address, mac_address,
                                       nsx_service_id, nsx_binding_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(port_id, ip_address) DO UPDATE SET
                subnet_id = excluded.subnet_id,
                mac_address = excluded.mac_address,
                nsx_service_id = excluded.nsx_service_id,
                nsx_binding_id = excluded.nsx_binding_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&binding.port_id)
        .bind(&binding.subnet_id)
        .bind(binding.ip_address.to_string())
        .bind(&binding.mac_address)
        .bind(&binding.nsx_service_id)
        .bind(&binding.nsx_binding_id)
        .bind(binding.created_at.to_rfc3339())
        .bind(binding.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a binding to a new address and/or MAC, keeping its backend ids.
    pub async fn update_dhcp_binding(
        &self,
        port_id: &str,
        old_ip: Ipv4Addr,
        subnet_id: &str,
        new_ip: Ipv4Addr,
        mac_address: &str,
    ) -> Result<bool> {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            UPDATE dhcp_bindings SET subnet_id = ?, ip_address = ?, mac_address = ?, updated_at = ?
            WHERE port_id = ? AND ip_address = ?
            "#,
        )
        .bind(subnet_id)
        .bind(new_ip.to_string())
        .bind(mac_address)
        .bind(&now)
        .bind(port_id)
        .bind(old_ip.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_dhcp_bindings(&self, port_id: &str) -> Result<Vec<DhcpBinding>> {
        let rows = sqlx::query(
            r#"
            SELECT port_id, subnet_id, ip_address, mac_address, nsx_service_id, nsx_binding_id,
                   created_at, updated_at
            FROM dhcp_bindings WHERE port_id = ? ORDER BY created_at, ip_address
            "#,
        )
        .bind(port_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_binding).collect()
    }

    pub async fn get_dhcp_bindings_by_service(
        &self,
        nsx_service_id: &str,
    ) -> Result<Vec<DhcpBinding>> {
        let rows = sqlx::query(
            r#"
            SELECT port_id, subnet_id, ip_address, mac_address, nsx_service_id, nsx_binding_id,
                   created_at, updated_at
            FROM dhcp_bindings WHERE nsx_service_id = ? ORDER BY port_id, ip_address
            "#,
        )
        .bind(nsx_service_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_binding).collect()
    }

    pub async fn list_dhcp_bindings(&self) -> Result<Vec<DhcpBinding>> {
        let rows = sqlx::query(
            r#"
            SELECT port_id, subnet_id, ip_address, mac_address, nsx_service_id, nsx_binding_id,
                   created_at, updated_at
            FROM dhcp_bindings ORDER BY port_id, ip_address
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_binding).collect()
    }

    pub async fn delete_dhcp_binding(&self, port_id: &str, ip_address: Ipv4Addr) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dhcp_bindings WHERE port_id = ? AND ip_address = ?")
            .bind(port_id)
            .bind(ip_address.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // === Switch and port mappings ===

    pub async fn set_network_mapping(&self, network_id: &str, nsx_switch_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO network_mappings (network_id, nsx_switch_id) VALUES (?, ?)
            ON CONFLICT(network_id) DO UPDATE SET nsx_switch_id = excluded.nsx_switch_id
            "#,
        )
        .bind(network_id)
        .bind(nsx_switch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_switch_id(&self, network_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT nsx_switch_id FROM network_mappings WHERE network_id = ?")
            .bind(network_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("nsx_switch_id")))
    }

    pub async fn set_port_mapping(&self, mapping: &PortMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO port_mappings (port_id, nsx_switch_id, nsx_port_id) VALUES (?, ?, ?)
            ON CONFLICT(port_id) DO UPDATE SET
                nsx_switch_id = excluded.nsx_switch_id,
                nsx_port_id = excluded.nsx_port_id
            "#,
        )
        .bind(&mapping.port_id)
        .bind(&mapping.nsx_switch_id)
        .bind(&mapping.nsx_port_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_port_mapping(&self, port_id: &str) -> Result<Option<PortMapping>> {
        let row = sqlx::query(
            "SELECT port_id, nsx_switch_id, nsx_port_id FROM port_mappings WHERE port_id = ?",
        )
        .bind(port_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| PortMapping {
            port_id: r.get("port_id"),
            nsx_switch_id: r.get("nsx_switch_id"),
            nsx_port_id: r.get("nsx_port_id"),
        }))
    }
}

fn parse_timestamp(table: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRecord {
            table,
            reason: format!("bad timestamp '{}': {}", raw, e),
        })
}

fn row_to_service_binding(row: &SqliteRow) -> Result<DhcpServiceBinding> {
    let created_at: String = row.try_get("created_at")?;
    Ok(DhcpServiceBinding {
        network_id: row.try_get("network_id")?,
        port_id: row.try_get("port_id")?,
        nsx_service_id: row.try_get("nsx_service_id")?,
        created_at: parse_timestamp("dhcp_service_bindings", &created_at)?,
    })
}

fn row_to_binding(row: &SqliteRow) -> Result<DhcpBinding> {
    let ip: String = row.try_get("ip_address")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(DhcpBinding {
        port_id: row.try_get("port_id")?,
        subnet_id: row.try_get("subnet_id")?,
        ip_address: ip.parse().map_err(|_| StoreError::InvalidRecord {
            table: "dhcp_bindings",
            reason: format!("bad IPv4 address '{}'", ip),
        })?,
        mac_address: row.try_get("mac_address")?,
        nsx_service_id: row.try_get("nsx_service_id")?,
        nsx_binding_id: row.try_get("nsx_binding_id")?,
        created_at: parse_timestamp("dhcp_bindings", &created_at)?,
        updated_at: parse_timestamp("dhcp_bindings", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_store() -> (MappingStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MappingStore::new(dir.path().to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    fn binding(port_id: &str, ip: &str, binding_id: &str) -> DhcpBinding {
        let now = Utc::now();
        DhcpBinding {
            port_id: port_id.to_string(),
            subnet_id: "subnet-1".to_string(),
            ip_address: ip.parse().unwrap(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            nsx_service_id: "server-1".to_string(),
            nsx_binding_id: binding_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_service_binding_crud() {
        let (store, _dir) = setup_store().await;

        assert!(store.get_dhcp_service_binding("net-1").await.unwrap().is_none());

        let entry = DhcpServiceBinding::new("net-1", "dhcp-port", "server-1");
        store.add_dhcp_service_binding(&entry).await.unwrap();

        let fetched = store.get_dhcp_service_binding("net-1").await.unwrap().unwrap();
        assert_eq!(fetched.port_id, "dhcp-port");
        assert_eq!(fetched.nsx_service_id, "server-1");

        // Re-adding for the same network replaces the server
        let entry = DhcpServiceBinding::new("net-1", "dhcp-port", "server-2");
        store.add_dhcp_service_binding(&entry).await.unwrap();
        let fetched = store.get_dhcp_service_binding("net-1").await.unwrap().unwrap();
        assert_eq!(fetched.nsx_service_id, "server-2");

        assert!(store.delete_dhcp_service_binding("net-1").await.unwrap());
        assert!(!store.delete_dhcp_service_binding("net-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_binding_rows_per_port_and_ip() {
        let (store, _dir) = setup_store().await;

        store.add_dhcp_binding(&binding("port-1", "10.0.0.3", "b1")).await.unwrap();
        store.add_dhcp_binding(&binding("port-1", "10.0.0.4", "b2")).await.unwrap();
        store.add_dhcp_binding(&binding("port-2", "10.0.0.5", "b3")).await.unwrap();

        let rows = store.get_dhcp_bindings("port-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(store.get_dhcp_bindings_by_service("server-1").await.unwrap().len(), 3);

        // Same (port, ip) replaces the backend binding id
        store.add_dhcp_binding(&binding("port-1", "10.0.0.3", "b9")).await.unwrap();
        let rows = store.get_dhcp_bindings("port-1").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|r| r.nsx_binding_id == "b9"));

        assert!(store.delete_dhcp_binding("port-1", "10.0.0.3".parse().unwrap()).await.unwrap());
        assert_eq!(store.get_dhcp_bindings("port-1").await.unwrap().len(), 1);
        assert_eq!(store.list_dhcp_bindings().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_update_binding_in_place() {
        let (store, _dir) = setup_store().await;
        store.add_dhcp_binding(&binding("port-1", "10.0.0.3", "b1")).await.unwrap();

        let updated = store
            .update_dhcp_binding(
                "port-1",
                "10.0.0.3".parse().unwrap(),
                "subnet-1",
                "10.0.0.4".parse().unwrap(),
                "11:22:33:44:55:66",
            )
            .await
            .unwrap();
        assert!(updated);

        let rows = store.get_dhcp_bindings("port-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ip_address, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(rows[0].mac_address, "11:22:33:44:55:66");
        assert_eq!(rows[0].nsx_binding_id, "b1");
    }

    #[tokio::test]
    async fn test_switch_and_port_mappings() {
        let (store, _dir) = setup_store().await;

        assert!(store.get_switch_id("net-1").await.unwrap().is_none());
        store.set_network_mapping("net-1", "ls-1").await.unwrap();
        assert_eq!(store.get_switch_id("net-1").await.unwrap().as_deref(), Some("ls-1"));

        let mapping = PortMapping {
            port_id: "port-1".to_string(),
            nsx_switch_id: "ls-1".to_string(),
            nsx_port_id: "lp-1".to_string(),
        };
        store.set_port_mapping(&mapping).await.unwrap();
        assert_eq!(store.get_port_mapping("port-1").await.unwrap(), Some(mapping));
    }
}
