//! Tenant attribution
//!
//! A tenant module registers one of its code units with the broker at start-up
//! and receives a [`TenantHandle`]. Every broker operation takes that handle
//! explicitly; the broker checks it was issued by itself before touching any
//! tenant data. The host's [`TenantRegistry`] is the only authority on which
//! tenant owns a code unit.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use crate::{Error, Result};

/// Host-side registry of tenants and the code units they own
pub trait TenantRegistry: Send + Sync {
    /// Tenant id owning `unit`, if any
    fn owner_of(&self, unit: &str) -> Option<String>;
}

impl<R: TenantRegistry + ?Sized> TenantRegistry for Arc<R> {
    fn owner_of(&self, unit: &str) -> Option<String> {
        (**self).owner_of(unit)
    }
}

/// In-memory registry
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    owners: HashMap<String, String>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `tenant` owns each of `units`
    pub fn with_tenant<I, S>(mut self, tenant: &str, units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for unit in units {
            self.owners.insert(unit.into(), tenant.to_string());
        }
        self
    }
}

impl TenantRegistry for StaticRegistry {
    fn owner_of(&self, unit: &str) -> Option<String> {
        self.owners.get(unit).cloned()
    }
}

/// Opaque capability proving a caller belongs to a tenant.
///
/// Only a broker can mint one, and a handle is only honoured by the broker
/// that minted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantHandle {
    tenant: String,
    broker: u64,
    token: u64,
}

impl TenantHandle {
    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

static NEXT_BROKER_ID: AtomicU64 = AtomicU64::new(1);

/// Issues and verifies tenant handles for one broker instance
pub struct TenantAttribution {
    broker: u64,
    registry: Box<dyn TenantRegistry>,
    next_token: AtomicU64,
    /// Code unit -> issued handle, filled once per distinct unit
    by_unit: DashMap<String, TenantHandle>,
    /// Token -> tenant for every handle this broker issued
    issued: DashMap<u64, String>,
}

impl TenantAttribution {
    pub fn new(registry: impl TenantRegistry + 'static) -> Self {
        Self {
            broker: NEXT_BROKER_ID.fetch_add(1, Ordering::Relaxed),
            registry: Box::new(registry),
            next_token: AtomicU64::new(1),
            by_unit: DashMap::new(),
            issued: DashMap::new(),
        }
    }

    /// Issue a handle for the tenant owning `unit`
    pub fn register(&self, unit: &str) -> Result<TenantHandle> {
        if let Some(handle) = self.by_unit.get(unit) {
            return Ok(handle.clone());
        }

        let Some(tenant) = self.registry.owner_of(unit) else {
            tracing::warn!(unit, "Refusing registration: no tenant owns this code unit");
            return Err(Error::AccessDenied(format!("no tenant owns code unit '{unit}'")));
        };
        if tenant.trim().is_empty() {
            tracing::warn!(unit, "Refusing registration: registry returned a blank tenant id");
            return Err(Error::AccessDenied(format!("blank tenant id for code unit '{unit}'")));
        }

        let handle = self
            .by_unit
            .entry(unit.to_string())
            .or_insert_with(|| {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                self.issued.insert(token, tenant.clone());
                tracing::info!(tenant = %tenant, unit, "Registered tenant code unit");
                TenantHandle {
                    tenant,
                    broker: self.broker,
                    token,
                }
            })
            .clone();
        Ok(handle)
    }

    /// Tenant id of a handle, if this broker issued it
    pub fn identify<'h>(&self, handle: &'h TenantHandle) -> Result<&'h str> {
        let genuine = handle.broker == self.broker
            && self
                .issued
                .get(&handle.token)
                .is_some_and(|tenant| *tenant == handle.tenant);

        if !genuine {
            tracing::warn!(tenant = %handle.tenant, "Rejected tenant handle not issued by this broker");
            return Err(Error::AccessDenied(format!(
                "handle for tenant '{}' was not issued by this broker",
                handle.tenant
            )));
        }
        Ok(&handle.tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StaticRegistry {
        StaticRegistry::new()
            .with_tenant("alpha", ["alpha_core", "alpha_ui"])
            .with_tenant("beta", ["beta_core"])
    }

    #[test]
    fn test_register_known_unit() {
        let attribution = TenantAttribution::new(registry());
        let handle = attribution.register("alpha_ui").unwrap();
        assert_eq!(handle.tenant(), "alpha");
        assert_eq!(attribution.identify(&handle).unwrap(), "alpha");
    }

    #[test]
    fn test_register_is_memoized_per_unit() {
        let attribution = TenantAttribution::new(registry());
        let first = attribution.register("alpha_core").unwrap();
        let second = attribution.register("alpha_core").unwrap();
        assert_eq!(first, second);

        let other_unit = attribution.register("alpha_ui").unwrap();
        assert_eq!(other_unit.tenant(), "alpha");
        assert_ne!(first, other_unit);
    }

    #[test]
    fn test_unknown_unit_denied() {
        let attribution = TenantAttribution::new(registry());
        assert!(matches!(attribution.register("gamma"), Err(Error::AccessDenied(_))));
    }

    #[test]
    fn test_foreign_handle_denied() {
        let ours = TenantAttribution::new(registry());
        let theirs = TenantAttribution::new(registry());
        let foreign = theirs.register("beta_core").unwrap();
        assert!(matches!(ours.identify(&foreign), Err(Error::AccessDenied(_))));
    }

    #[test]
    fn test_shared_registry() {
        let shared = Arc::new(registry());
        let attribution = TenantAttribution::new(Arc::clone(&shared));
        assert_eq!(attribution.register("beta_core").unwrap().tenant(), "beta");
    }
}
