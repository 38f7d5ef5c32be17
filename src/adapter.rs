use crate::config::AdapterParams;
use crate::error::ChappsError;
use log::debug;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;

/// Inbound enforcement flags carried on a domain's config record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainFlags {
    /// if true perform greylisting
    pub greylist: bool,
    /// if true enforce SPF
    pub check_spf: bool,
}

/// Read-only projections over the relational configuration of record.
///
/// All queries are short, indexed and idempotent; the pool keeps a few
/// warm connections so a cold policy cache miss costs one round trip.
pub struct PolicyConfigAdapter {
    pool: MySqlPool,
}

impl PolicyConfigAdapter {
    pub async fn connect(params: &AdapterParams) -> Result<Self, ChappsError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&params.url())
            .await?;
        debug!(
            "Connected to {} config store at {}:{}/{}",
            params.adapter, params.db_host, params.db_port, params.db_name
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool, mainly for tests
    pub fn from_pool(pool: MySqlPool) -> Self {
        Self { pool }
    }

    /// Return the configured transmission quota for a user account
    pub async fn quota_for_user(&self, user: &str) -> Result<Option<i64>, ChappsError> {
        let quota = sqlx::query_scalar::<_, i64>(
            "SELECT q.quota FROM quotas AS q \
             JOIN quota_user AS j ON q.id = j.quota_id \
             JOIN users AS u ON u.id = j.user_id \
             WHERE u.name = ?",
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;
        Ok(quota)
    }

    /// True iff the user is associated with the domain
    pub async fn check_domain_for_user(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<bool, ChappsError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(d.name) FROM domains AS d \
             LEFT JOIN domain_user AS j ON d.id = j.domain_id \
             LEFT JOIN users AS u ON u.id = j.user_id \
             WHERE d.name = ? AND u.name = ?",
        )
        .bind(domain)
        .bind(user)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// True iff the user is associated with that full email address
    pub async fn check_email_for_user(
        &self,
        user: &str,
        email: &str,
    ) -> Result<bool, ChappsError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(e.name) FROM emails AS e \
             LEFT JOIN email_user AS j ON e.id = j.email_id \
             LEFT JOIN users AS u ON u.id = j.user_id \
             WHERE e.name = ? AND u.name = ?",
        )
        .bind(email)
        .bind(user)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Enforcement flags for inbound filtering; `None` when the domain has
    /// no config record at all
    pub async fn domain_flags(&self, domain: &str) -> Result<Option<DomainFlags>, ChappsError> {
        let row = sqlx::query_as::<_, (bool, bool)>(
            "SELECT greylist, check_spf FROM domains WHERE name = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(greylist, check_spf)| DomainFlags {
            greylist,
            check_spf,
        }))
    }
}
