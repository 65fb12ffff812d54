//! Tenant identifiers and the process-wide master tenant.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DomainError;
use crate::token::Token;

/// UUID of a tenant in the multi-tenancy hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantUuid(Uuid);

impl TenantUuid {
    pub const fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for TenantUuid {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| DomainError::InvalidTenant {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for TenantUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared, set-once holder of the platform's master tenant.
///
/// Cloning is cheap; every clone observes the same cell, so the value set
/// by the controller is visible to all workers without messaging. Only the
/// first successful `set_master_tenant` is kept.
#[derive(Debug, Clone, Default)]
pub struct MasterTenantProxy {
    cell: Arc<OnceLock<TenantUuid>>,
}

impl MasterTenantProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the tenant of `token` as the master tenant.
    ///
    /// Returns true if the value was stored by this call. Later calls,
    /// and tokens without a tenant, are no-ops.
    pub fn set_master_tenant(&self, token: &Token) -> bool {
        let Some(tenant) = token.tenant() else {
            debug!("Service token carries no tenant, master tenant left unset");
            return false;
        };

        match self.cell.set(*tenant) {
            Ok(()) => {
                info!(master_tenant = %tenant, "Master tenant set");
                true
            }
            Err(_) => {
                debug!(ignored = %tenant, "Master tenant already set, ignoring");
                false
            }
        }
    }

    /// Returns the master tenant once it is known.
    pub fn get(&self) -> Option<TenantUuid> {
        self.cell.get().copied()
    }

    /// Returns true if `tenant` is the master tenant.
    ///
    /// Always false until the master tenant has been discovered.
    pub fn is_master(&self, tenant: &TenantUuid) -> bool {
        self.cell.get() == Some(tenant)
    }
}
