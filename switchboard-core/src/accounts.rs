//! Phone accounts and the backends that serve them

use crate::backend::ConnectionService;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifies one account registered by one backend package
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhoneAccountHandle {
    /// Package of the backend that registered the account
    pub package: String,
    /// Account id, unique within the package
    pub id: String,
}

impl PhoneAccountHandle {
    /// Create a handle
    pub fn new(package: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            id: id.into(),
        }
    }

    /// Whether both handles belong to the same backend package
    #[must_use]
    pub fn same_package(&self, other: &PhoneAccountHandle) -> bool {
        self.package == other.package
    }
}

impl std::fmt::Display for PhoneAccountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.package, self.id)
    }
}

/// Declared abilities of a registered account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneAccount {
    /// Account handle
    pub handle: PhoneAccountHandle,
    /// User-visible label
    pub label: String,
    /// URI schemes the account can dial (e.g. `tel`, `sip`)
    pub uri_schemes: Vec<String>,
    /// Account is backed by a SIM subscription
    pub is_sim: bool,
    /// Account may place emergency calls
    pub emergency_capable: bool,
    /// Backend manages its own calls and UI
    pub self_managed: bool,
    /// Calls may be handed over away from this account
    pub supports_handover_from: bool,
    /// Calls may be handed over to this account
    pub supports_handover_to: bool,
    /// Account supports video calling
    pub supports_video: bool,
    /// Account is enabled by the user
    pub enabled: bool,
}

impl PhoneAccount {
    /// A managed SIM account dialing `tel:` addresses
    pub fn sim(handle: PhoneAccountHandle, label: impl Into<String>) -> Self {
        Self {
            handle,
            label: label.into(),
            uri_schemes: vec!["tel".to_string()],
            is_sim: true,
            emergency_capable: true,
            self_managed: false,
            supports_handover_from: false,
            supports_handover_to: false,
            supports_video: false,
            enabled: true,
        }
    }

    /// A managed non-SIM account (e.g. a SIP provider)
    pub fn managed(handle: PhoneAccountHandle, label: impl Into<String>) -> Self {
        Self {
            is_sim: false,
            emergency_capable: false,
            uri_schemes: vec!["tel".to_string(), "sip".to_string()],
            ..Self::sim(handle, label)
        }
    }

    /// A self-managed account
    pub fn self_managed(handle: PhoneAccountHandle, label: impl Into<String>) -> Self {
        Self {
            self_managed: true,
            ..Self::managed(handle, label)
        }
    }

    /// Copy with handover support in both directions
    #[must_use]
    pub fn with_handover(mut self) -> Self {
        self.supports_handover_from = true;
        self.supports_handover_to = true;
        self
    }

    /// Whether the account can dial `address`
    #[must_use]
    pub fn supports_address(&self, address: &str) -> bool {
        let scheme = address.split_once(':').map_or("tel", |(scheme, _)| scheme);
        self.uri_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }
}

struct RegisteredAccount {
    account: PhoneAccount,
    service: Arc<dyn ConnectionService>,
}

/// Registered accounts and their backends, in registration order
#[derive(Default)]
pub struct PhoneAccountRegistry {
    accounts: RwLock<Vec<RegisteredAccount>>,
    default_outgoing: RwLock<Option<PhoneAccountHandle>>,
}

impl PhoneAccountRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account served by `service`, replacing any previous
    /// registration of the same handle
    pub fn register(&self, account: PhoneAccount, service: Arc<dyn ConnectionService>) {
        tracing::info!(account = %account.handle, self_managed = account.self_managed, "Registering phone account");
        let mut accounts = self.accounts.write();
        accounts.retain(|entry| entry.account.handle != account.handle);
        accounts.push(RegisteredAccount { account, service });
    }

    /// Remove an account
    pub fn unregister(&self, handle: &PhoneAccountHandle) {
        self.accounts.write().retain(|entry| &entry.account.handle != handle);
        let mut default = self.default_outgoing.write();
        if default.as_ref() == Some(handle) {
            *default = None;
        }
    }

    /// Set the user's default outgoing account
    pub fn set_default_outgoing(&self, handle: Option<PhoneAccountHandle>) {
        *self.default_outgoing.write() = handle;
    }

    /// The user's default outgoing account, if still registered and enabled
    #[must_use]
    pub fn default_outgoing(&self) -> Option<PhoneAccountHandle> {
        let handle = self.default_outgoing.read().clone()?;
        self.get(&handle)
            .filter(|account| account.enabled)
            .map(|account| account.handle)
    }

    /// Number of registered accounts
    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.read().len()
    }

    /// Whether no account is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.read().is_empty()
    }

    /// Look up an account
    #[must_use]
    pub fn get(&self, handle: &PhoneAccountHandle) -> Option<PhoneAccount> {
        self.accounts
            .read()
            .iter()
            .find(|entry| &entry.account.handle == handle)
            .map(|entry| entry.account.clone())
    }

    /// Backend serving an account
    #[must_use]
    pub fn service_for(&self, handle: &PhoneAccountHandle) -> Option<Arc<dyn ConnectionService>> {
        self.accounts
            .read()
            .iter()
            .find(|entry| &entry.account.handle == handle)
            .map(|entry| Arc::clone(&entry.service))
    }

    /// Whether the account belongs to a self-managed backend
    #[must_use]
    pub fn is_self_managed(&self, handle: &PhoneAccountHandle) -> bool {
        self.get(handle).is_some_and(|account| account.self_managed)
    }

    /// Enabled managed accounts able to dial `address`
    #[must_use]
    pub fn callable_accounts(&self, address: &str) -> Vec<PhoneAccount> {
        self.accounts
            .read()
            .iter()
            .map(|entry| &entry.account)
            .filter(|account| account.enabled && !account.self_managed)
            .filter(|account| account.supports_address(address))
            .cloned()
            .collect()
    }

    /// Emergency-capable accounts, SIM accounts first
    #[must_use]
    pub fn emergency_accounts(&self) -> Vec<PhoneAccount> {
        let mut accounts: Vec<PhoneAccount> = self
            .accounts
            .read()
            .iter()
            .map(|entry| &entry.account)
            .filter(|account| account.emergency_capable && !account.self_managed)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| !account.is_sim);
        accounts
    }
}

impl std::fmt::Debug for PhoneAccountRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handles: Vec<PhoneAccountHandle> = self
            .accounts
            .read()
            .iter()
            .map(|entry| entry.account.handle.clone())
            .collect();
        f.debug_struct("PhoneAccountRegistry")
            .field("accounts", &handles)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackConnectionService;

    fn registry() -> PhoneAccountRegistry {
        let registry = PhoneAccountRegistry::new();
        let service = Arc::new(LoopbackConnectionService::new());
        registry.register(
            PhoneAccount::managed(PhoneAccountHandle::new("com.voip", "sip"), "VoIP"),
            service.clone(),
        );
        registry.register(
            PhoneAccount::sim(PhoneAccountHandle::new("com.telephony", "sim1"), "SIM 1"),
            service,
        );
        registry
    }

    #[test]
    fn test_emergency_accounts_sim_first() {
        let mut voip = PhoneAccount::managed(PhoneAccountHandle::new("com.voip", "sip"), "VoIP");
        voip.emergency_capable = true;
        let registry = registry();
        registry.register(voip, Arc::new(LoopbackConnectionService::new()));

        let accounts = registry.emergency_accounts();
        assert_eq!(accounts.len(), 2);
        assert!(accounts[0].is_sim);
    }

    #[test]
    fn test_callable_accounts_by_scheme() {
        let registry = registry();
        assert_eq!(registry.callable_accounts("tel:555-1234").len(), 2);
        assert_eq!(registry.callable_accounts("sip:bob@example.com").len(), 1);
    }

    #[test]
    fn test_default_outgoing_cleared_on_unregister() {
        let registry = registry();
        let sim = PhoneAccountHandle::new("com.telephony", "sim1");
        registry.set_default_outgoing(Some(sim.clone()));
        assert_eq!(registry.default_outgoing(), Some(sim.clone()));

        registry.unregister(&sim);
        assert!(registry.default_outgoing().is_none());
        assert!(registry.service_for(&sim).is_none());
    }
}
