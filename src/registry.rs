//! Service and method registry.
//!
//! Services are keyed by their static name and map to the transport-level
//! [`ServiceHandle`] created for them. Methods form an append-only sequence;
//! a method's index is its position at creation and is never reused.
//!
//! One mutex guards both. It is only taken at registration time and by
//! diagnostics, never on the per-call path: call instances hold their
//! `Arc<MethodDescriptor>` directly.

use crate::error::RegistrationError;
use crate::method::MethodDescriptor;
use crate::transport::ServiceHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A registered service.
#[derive(Debug)]
pub struct ServiceDescriptor {
    name: &'static str,
    handle: ServiceHandle,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(name: &'static str, handle: ServiceHandle) -> Self {
        Self { name, handle }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn handle(&self) -> &ServiceHandle {
        &self.handle
    }
}

#[derive(Default)]
struct Entries {
    services: HashMap<&'static str, Arc<ServiceDescriptor>>,
    methods: Vec<Arc<MethodDescriptor>>,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<Entries>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains_service(&self, name: &str) -> bool {
        self.entries.lock().services.contains_key(name)
    }

    /// Records a service. An existing entry is never overwritten.
    pub(crate) fn insert_service(
        &self,
        service: ServiceDescriptor,
    ) -> Result<Arc<ServiceDescriptor>, RegistrationError> {
        let mut entries = self.entries.lock();
        if entries.services.contains_key(service.name) {
            return Err(RegistrationError::DuplicateService(service.name.to_string()));
        }
        let service = Arc::new(service);
        entries.services.insert(service.name, Arc::clone(&service));
        Ok(service)
    }

    #[cfg(test)]
    pub(crate) fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.entries.lock().services.get(name).cloned()
    }

    /// Appends a method to `service`. `admit` runs under the registry lock
    /// before anything else and can veto the append; `build` receives the
    /// owning descriptor and the index the method will occupy.
    pub(crate) fn add_method(
        &self,
        service: &str,
        method: &str,
        admit: impl FnOnce() -> Result<(), RegistrationError>,
        build: impl FnOnce(Arc<ServiceDescriptor>, usize) -> MethodDescriptor,
    ) -> Result<Arc<MethodDescriptor>, RegistrationError> {
        let mut entries = self.entries.lock();
        admit()?;
        let Some(owner) = entries.services.get(service).cloned() else {
            return Err(RegistrationError::UnknownService(service.to_string()));
        };
        let duplicate = entries
            .methods
            .iter()
            .any(|m| m.service().name() == service && m.name() == method);
        if duplicate {
            return Err(RegistrationError::DuplicateMethod {
                service: service.to_string(),
                method: method.to_string(),
            });
        }
        let index = entries.methods.len();
        let descriptor = Arc::new(build(owner, index));
        entries.methods.push(Arc::clone(&descriptor));
        Ok(descriptor)
    }

    #[cfg(test)]
    pub(crate) fn method(&self, index: usize) -> Option<Arc<MethodDescriptor>> {
        self.entries.lock().methods.get(index).cloned()
    }

    /// Runs `f` while holding the registry lock, so no method is appended
    /// concurrently.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _entries = self.entries.lock();
        f()
    }

    pub(crate) fn method_count(&self) -> usize {
        self.entries.lock().methods.len()
    }

    /// Registered service names, sorted.
    pub(crate) fn service_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.lock().services.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn methods(&self) -> Vec<Arc<MethodDescriptor>> {
        self.entries.lock().methods.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::RpcCall;
    use crate::state::ServerState;

    fn noop_method(service: Arc<ServiceDescriptor>, name: &str, index: usize) -> MethodDescriptor {
        MethodDescriptor::new(
            service,
            name,
            index,
            |_: &RpcCall<(), ()>| {},
            |call: &mut RpcCall<(), ()>| call.respond(()),
            None,
        )
    }

    fn registry_with(service: &'static str) -> Registry {
        let registry = Registry::new();
        registry
            .insert_service(ServiceDescriptor::new(service, ServiceHandle::new(service, 0)))
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_service_keeps_first_entry() {
        let registry = registry_with("svc");
        let second = ServiceDescriptor::new("svc", ServiceHandle::new("svc", 7));
        assert!(matches!(
            registry.insert_service(second),
            Err(RegistrationError::DuplicateService(_))
        ));
        assert_eq!(registry.service("svc").unwrap().handle().id(), 0);
        assert_eq!(registry.service_names(), vec!["svc"]);
    }

    #[test]
    fn test_method_index_is_registry_position() {
        let registry = registry_with("svc");
        for (expected, name) in ["A", "B", "C"].into_iter().enumerate() {
            let method = registry
                .add_method("svc", name, || Ok(()), |s, i| noop_method(s, name, i))
                .unwrap();
            assert_eq!(method.index(), expected);
            assert_eq!(registry.method(expected).unwrap().name(), name);
        }
        assert_eq!(registry.method_count(), 3);
    }

    #[test]
    fn test_unknown_service_leaves_registry_unchanged() {
        let registry = registry_with("svc");
        let err = registry
            .add_method("missing", "A", || Ok(()), |s, i| noop_method(s, "A", i))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::UnknownService(name) if name == "missing"));
        assert_eq!(registry.method_count(), 0);
    }

    #[test]
    fn test_duplicate_method_rejected() {
        let registry = registry_with("svc");
        registry
            .add_method("svc", "A", || Ok(()), |s, i| noop_method(s, "A", i))
            .unwrap();
        assert!(matches!(
            registry.add_method("svc", "A", || Ok(()), |s, i| noop_method(s, "A", i)),
            Err(RegistrationError::DuplicateMethod { .. })
        ));
        assert_eq!(registry.methods().len(), 1);
    }

    #[test]
    fn test_vetoed_method_is_not_appended() {
        let registry = registry_with("svc");
        let err = registry
            .add_method(
                "svc",
                "A",
                || {
                    Err(RegistrationError::InvalidState {
                        operation: "register a method",
                        expected: ServerState::Running,
                        actual: ServerState::ShuttingDown,
                    })
                },
                |s, i| noop_method(s, "A", i),
            )
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidState { .. }));
        assert_eq!(registry.method_count(), 0);
    }
}
