//! Postgres-backed [`Store`] implementation
//!
//! Uses `sqlx`'s runtime-checked `query`/`query_as` API exclusively — never
//! the `query!`/`query_as!` macros, since those require a live database or an
//! `SQLX_OFFLINE` metadata cache at compile time that this deployment does
//! not maintain.

use super::models::*;
use super::Store;
use crate::error::{CoreError, Result};
use crate::types::{NodeName, PendingRequestId, Protocol, ResourceRequirement, ServerId, ServerStatus, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};

/// The statuses excluded from capacity accounting (invariant 4 / P2), as
/// their fixed `ServerStatus::Display` literals for use in a `status =
/// ANY($n)` bind. These never vary, so there's no dynamic derivation here
/// beyond keeping the list in one place next to `ServerStatus::excluded_from_capacity`.
fn terminal_status_strings() -> Vec<String> {
    ServerStatus::ALL
        .into_iter()
        .filter(|s| s.excluded_from_capacity())
        .map(|s| s.to_string())
        .collect()
}

/// Postgres-backed store. Holds a connection pool; safe to clone and share
/// across tasks.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and run migrations under an advisory lock (§4.1), so that
    /// multiple control-plane replicas starting concurrently don't race.
    pub async fn connect(db_url: &str) -> Result<Self> {
        let pool = PgPool::connect(db_url).await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Wrap an already-constructed pool (used by tests and tools that need
    /// a custom pool configuration).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run_migrations(pool: &PgPool) -> Result<()> {
        const LOCK_KEY: i64 = 0x6761_6d65; // "game" in hex, arbitrary but stable
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(LOCK_KEY)
            .execute(pool)
            .await?;

        let result = sqlx::migrate!("./migrations").run(pool).await;

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(LOCK_KEY)
            .execute(pool)
            .await?;

        result.map_err(|e| CoreError::internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    async fn fetch_server_ports(&self, server_id: ServerId, tx: &mut Transaction<'_, Postgres>) -> Result<Vec<PortAllocation>> {
        let rows = sqlx::query_as::<_, PortAllocation>(
            r#"
            SELECT node_name, port, protocol, port_name, allocated_at
            FROM port_slots
            WHERE server_id = $1 AND allocated_at IS NOT NULL
            ORDER BY port_name
            "#,
        )
        .bind(server_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, password_hash))]
    async fn create_user(&self, email: &str, password_hash: &str) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, email, password_hash, email_verified, billing_customer_handle, created_at, updated_at)
            VALUES ($1, $2, $3, false, NULL, now(), now())
            RETURNING *
            "#,
        )
        .bind(UserId::new())
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                CoreError::validation(format!("email already registered: {email}"))
            }
            _ => CoreError::from(e),
        })?;
        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn mark_email_verified(&self, id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET email_verified = true, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_user_password(&self, id: UserId, password_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = now() WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_billing_customer_handle(&self, id: UserId, handle: &str) -> Result<()> {
        sqlx::query("UPDATE users SET billing_customer_handle = $1, updated_at = now() WHERE id = $2")
            .bind(handle)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, auth_token))]
    async fn create_server(
        &self,
        user_id: UserId,
        display_name: &str,
        subdomain: &str,
        game: &str,
        plan: &str,
        subscription_handle: Option<&str>,
        auth_token: &str,
    ) -> Result<Server> {
        let server = sqlx::query_as::<_, Server>(
            r#"
            INSERT INTO servers (
                id, user_id, display_name, subdomain, game, plan, status, status_message,
                subscription_handle, env_overrides, auth_token, last_heartbeat, node_name,
                reserved_cpu_millicores, reserved_memory_bytes, created_at, updated_at,
                stopped_at, expired_at, delete_after, last_reconciled, creation_error
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, NULL,
                $8, NULL, $9, NULL, NULL,
                0, 0, now(), now(),
                NULL, NULL, NULL, NULL, NULL
            )
            RETURNING *
            "#,
        )
        .bind(ServerId::new())
        .bind(user_id)
        .bind(display_name)
        .bind(subdomain)
        .bind(game)
        .bind(plan)
        .bind(ServerStatus::Pending)
        .bind(subscription_handle)
        .bind(auth_token)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.constraint().is_some() => {
                CoreError::conflict(format!("subdomain already taken: {subdomain}"))
            }
            _ => CoreError::from(e),
        })?;
        Ok(server)
    }

    async fn get_server(&self, id: ServerId) -> Result<Option<Server>> {
        let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(server)
    }

    async fn get_server_with_details(&self, id: ServerId) -> Result<Option<ServerWithDetails>> {
        let Some(server) = self.get_server(id).await? else {
            return Ok(None);
        };
        let ports = sqlx::query_as::<_, PortAllocation>(
            r#"
            SELECT node_name, port, protocol, port_name, allocated_at
            FROM port_slots
            WHERE server_id = $1 AND allocated_at IS NOT NULL
            ORDER BY port_name
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(Some(ServerWithDetails { server, ports }))
    }

    async fn list_servers_by_user(&self, user_id: UserId) -> Result<Vec<Server>> {
        let servers = sqlx::query_as::<_, Server>(
            "SELECT * FROM servers WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(servers)
    }

    async fn list_all_servers(&self) -> Result<Vec<Server>> {
        let servers = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(servers)
    }

    async fn list_servers_by_status(&self, status: ServerStatus) -> Result<Vec<Server>> {
        let servers = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE status = $1 ORDER BY created_at")
            .bind(status)
            .fetch_all(&self.pool)
            .await?;
        Ok(servers)
    }

    async fn subdomain_exists(&self, subdomain: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM servers WHERE subdomain = $1")
            .bind(subdomain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn get_server_by_subscription_handle(&self, handle: &str) -> Result<Option<Server>> {
        let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE subscription_handle = $1")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(server)
    }

    #[instrument(skip(self))]
    async fn transition_server_status(
        &self,
        id: ServerId,
        from: &[ServerStatus],
        to: ServerStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        let from_strings: Vec<String> = from.iter().map(|s| s.to_string()).collect();

        let mut set_extra = String::new();
        match to {
            ServerStatus::Stopped => set_extra.push_str(", stopped_at = now()"),
            ServerStatus::Expired => set_extra.push_str(", expired_at = now()"),
            _ => {}
        }

        let sql = format!(
            "UPDATE servers SET status = $1, status_message = $2, updated_at = now(){set_extra} \
             WHERE id = $3 AND status = ANY($4) RETURNING id"
        );

        let row = sqlx::query(&sql)
            .bind(to)
            .bind(message)
            .bind(id)
            .bind(&from_strings)
            .fetch_optional(&self.pool)
            .await?;

        let transitioned = row.is_some();
        if !transitioned {
            debug!(server_id = %id, ?to, "transition rejected: status not in expected set");
        }
        Ok(transitioned)
    }

    async fn set_server_env_overrides(&self, id: ServerId, overrides: Option<HashMap<String, String>>) -> Result<()> {
        let json = overrides.map(|m| serde_json::to_value(m)).transpose()?;
        sqlx::query("UPDATE servers SET env_overrides = $1, updated_at = now() WHERE id = $2")
            .bind(json)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_heartbeat(&self, id: ServerId) -> Result<()> {
        sqlx::query("UPDATE servers SET last_heartbeat = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_creation_error(&self, id: ServerId, error: &str) -> Result<()> {
        sqlx::query("UPDATE servers SET creation_error = $1, updated_at = now() WHERE id = $2")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_delete_after(&self, id: ServerId, delete_after: Option<DateTime<Utc>>) -> Result<()> {
        sqlx::query("UPDATE servers SET delete_after = $1, updated_at = now() WHERE id = $2")
            .bind(delete_after)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_reconciled(&self, id: ServerId) -> Result<()> {
        sqlx::query("UPDATE servers SET last_reconciled = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn hard_delete_server(&self, id: ServerId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE port_slots SET server_id = NULL, port_name = NULL, allocated_at = NULL WHERE server_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM servers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_node(
        &self,
        name: &NodeName,
        public_ip: &str,
        allocatable_cpu_millicores: i64,
        allocatable_memory_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (name, public_ip, active, allocatable_cpu_millicores, allocatable_memory_bytes, created_at, updated_at)
            VALUES ($1, $2, true, $3, $4, now(), now())
            ON CONFLICT (name) DO UPDATE SET
                public_ip = EXCLUDED.public_ip,
                active = true,
                allocatable_cpu_millicores = EXCLUDED.allocatable_cpu_millicores,
                allocatable_memory_bytes = EXCLUDED.allocatable_memory_bytes,
                updated_at = now()
            "#,
        )
        .bind(&name.0)
        .bind(public_ip)
        .bind(allocatable_cpu_millicores)
        .bind(allocatable_memory_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_node_active(&self, name: &NodeName, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE nodes SET active = $1, updated_at = now() WHERE name = $2")
            .bind(active)
            .bind(&name.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(node = %name, "set_node_active on unknown node");
        }
        Ok(())
    }

    async fn list_active_nodes(&self) -> Result<Vec<Node>> {
        let nodes = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE active ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(nodes)
    }

    async fn initialize_node_ports(&self, node: &NodeName, min_port: u16, max_port: u16) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for port in min_port..=max_port {
            for protocol in [Protocol::Tcp, Protocol::Udp] {
                sqlx::query(
                    r#"
                    INSERT INTO port_slots (node_name, port, protocol, server_id, port_name, allocated_at)
                    VALUES ($1, $2, $3, NULL, NULL, NULL)
                    ON CONFLICT (node_name, port, protocol) DO NOTHING
                    "#,
                )
                .bind(&node.0)
                .bind(port as i32)
                .bind(protocol)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, requirements))]
    async fn allocate_ports_for_server(
        &self,
        server_id: ServerId,
        requirements: &[PortRequirement],
        resource: ResourceRequirement,
    ) -> Result<Allocation> {
        let mut tx = self.pool.begin().await?;
        let excluded_statuses = terminal_status_strings();

        // Row-lock active nodes whose allocatable capacity, minus what's
        // already reserved by servers pinned there (invariant 4 / P2), covers
        // the request; ordered by free-port count descending so concurrent
        // allocations fan out rather than piling onto one node.
        let candidate_nodes = sqlx::query_as::<_, Node>(
            r#"
            SELECT n.* FROM nodes n
            WHERE n.active
              AND n.allocatable_cpu_millicores - COALESCE((
                    SELECT SUM(s.reserved_cpu_millicores) FROM servers s
                    WHERE s.node_name = n.name AND NOT (s.status = ANY($3))
                  ), 0) >= $1
              AND n.allocatable_memory_bytes - COALESCE((
                    SELECT SUM(s.reserved_memory_bytes) FROM servers s
                    WHERE s.node_name = n.name AND NOT (s.status = ANY($3))
                  ), 0) >= $2
            ORDER BY (
                SELECT COUNT(*) FROM port_slots ps WHERE ps.node_name = n.name AND ps.server_id IS NULL
            ) DESC
            FOR UPDATE
            "#,
        )
        .bind(resource.cpu_millicores)
        .bind(resource.memory_bytes)
        .bind(&excluded_statuses)
        .fetch_all(&mut *tx)
        .await?;

        for node in candidate_nodes {
            let mut allocated = Vec::with_capacity(requirements.len());
            let mut ok = true;

            for req in requirements {
                let row = sqlx::query(
                    r#"
                    SELECT port FROM port_slots
                    WHERE node_name = $1 AND protocol = $2 AND server_id IS NULL
                    ORDER BY port
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(&node.name)
                .bind(req.protocol)
                .fetch_optional(&mut *tx)
                .await?;

                match row {
                    Some(row) => {
                        let port: i32 = row.try_get("port")?;
                        sqlx::query(
                            "UPDATE port_slots SET server_id = $1, port_name = $2, allocated_at = now() \
                             WHERE node_name = $3 AND port = $4 AND protocol = $5",
                        )
                        .bind(server_id)
                        .bind(&req.port_name)
                        .bind(&node.name)
                        .bind(port)
                        .bind(req.protocol)
                        .execute(&mut *tx)
                        .await?;
                        allocated.push(AllocatedPort {
                            port_name: req.port_name.clone(),
                            protocol: req.protocol,
                            port,
                        });
                    }
                    None => {
                        ok = false;
                        break;
                    }
                }
            }

            if ok {
                sqlx::query(
                    "UPDATE servers SET node_name = $1, reserved_cpu_millicores = $2, \
                     reserved_memory_bytes = $3, updated_at = now() WHERE id = $4",
                )
                .bind(&node.name)
                .bind(resource.cpu_millicores)
                .bind(resource.memory_bytes)
                .bind(server_id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await?;
                debug!(server_id = %server_id, node = %node.name, "allocated ports");
                return Ok(Allocation { node, ports: allocated });
            }
            // this node didn't have enough free ports; loosen the per-port
            // locks (rollback is per-statement via SKIP LOCKED semantics,
            // so just continue to the next candidate within the same tx)
        }

        tx.rollback().await?;
        Err(CoreError::capacity(format!(
            "no node with free ports and capacity for {} requirement(s)",
            requirements.len()
        )))
    }

    async fn release_server_ports(&self, server_id: ServerId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE port_slots SET server_id = NULL, port_name = NULL, allocated_at = NULL WHERE server_id = $1")
            .bind(server_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE servers SET node_name = NULL, reserved_cpu_millicores = 0, \
             reserved_memory_bytes = 0, updated_at = now() WHERE id = $1",
        )
        .bind(server_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn has_capacity(&self, resource: ResourceRequirement) -> Result<bool> {
        let excluded_statuses = terminal_status_strings();
        let row = sqlx::query(
            r#"
            SELECT 1 FROM nodes n
            WHERE n.active
              AND n.allocatable_cpu_millicores - COALESCE((
                    SELECT SUM(s.reserved_cpu_millicores) FROM servers s
                    WHERE s.node_name = n.name AND NOT (s.status = ANY($3))
                  ), 0) >= $1
              AND n.allocatable_memory_bytes - COALESCE((
                    SELECT SUM(s.reserved_memory_bytes) FROM servers s
                    WHERE s.node_name = n.name AND NOT (s.status = ANY($3))
                  ), 0) >= $2
            LIMIT 1
            "#,
        )
        .bind(resource.cpu_millicores)
        .bind(resource.memory_bytes)
        .bind(&excluded_statuses)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn create_pending_request(
        &self,
        user_id: UserId,
        display_name: &str,
        subdomain: &str,
        game: &str,
        plan: &str,
        payment_session_id: &str,
        resubscribe_server_id: Option<ServerId>,
        expires_at: DateTime<Utc>,
    ) -> Result<PendingRequest> {
        let pending = sqlx::query_as::<_, PendingRequest>(
            r#"
            INSERT INTO pending_requests (
                id, user_id, display_name, subdomain, game, plan, status,
                payment_session_id, resubscribe_server_id, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), $10)
            RETURNING *
            "#,
        )
        .bind(PendingRequestId::new())
        .bind(user_id)
        .bind(display_name)
        .bind(subdomain)
        .bind(game)
        .bind(plan)
        .bind(PendingRequestStatus::AwaitingPayment)
        .bind(payment_session_id)
        .bind(resubscribe_server_id)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(pending)
    }

    async fn get_pending_request(&self, id: PendingRequestId) -> Result<Option<PendingRequest>> {
        let pending = sqlx::query_as::<_, PendingRequest>("SELECT * FROM pending_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(pending)
    }

    async fn get_pending_request_by_session(&self, payment_session_id: &str) -> Result<Option<PendingRequest>> {
        let pending = sqlx::query_as::<_, PendingRequest>(
            "SELECT * FROM pending_requests WHERE payment_session_id = $1",
        )
        .bind(payment_session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(pending)
    }

    async fn mark_pending_request_completed(&self, id: PendingRequestId) -> Result<()> {
        sqlx::query("UPDATE pending_requests SET status = $1 WHERE id = $2")
            .bind(PendingRequestStatus::Completed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_pending_request_failed(&self, id: PendingRequestId) -> Result<()> {
        sqlx::query("UPDATE pending_requests SET status = $1 WHERE id = $2")
            .bind(PendingRequestStatus::Failed)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_expired_pending_requests(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pending_requests WHERE expires_at < now() AND status = $1")
            .bind(PendingRequestStatus::AwaitingPayment)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_billing_event(&self, stripe_event_id: &str) -> Result<Option<BillingEvent>> {
        let event = sqlx::query_as::<_, BillingEvent>("SELECT * FROM billing_events WHERE stripe_event_id = $1")
            .bind(stripe_event_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn record_billing_event(
        &self,
        stripe_event_id: &str,
        event_type: &str,
        status: BillingEventStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (stripe_event_id, event_type, status, error, created_at, processed_at)
            VALUES ($1, $2, $3, $4, now(), now())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                status = EXCLUDED.status,
                error = EXCLUDED.error,
                processed_at = now()
            "#,
        )
        .bind(stripe_event_id)
        .bind(event_type)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
