//! Class registry and dispatch.
//!
//! The registry maps class ids to shared handlers. Encoding and decoding go
//! through it so that security encapsulation is applied in one place and new
//! classes only need [`ClassRegistry::register`].

use std::collections::HashMap;
use std::sync::Arc;

use meshgate_protocol::Expect;
use tracing::{debug, trace};

use crate::builtin;
use crate::class::{ClassCommand, ClassId, CommandClass, CommandClassBinding, UnitId, Update, Verb};
use crate::error::{ClassError, ClassResult};
use crate::security::SecurityLayer;

/// A received class payload with encapsulation removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPayload {
    /// Plain class payload.
    pub bytes: Vec<u8>,
    /// Whether it arrived encapsulated.
    pub secure: bool,
}

/// Open set of command-class handlers.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: HashMap<ClassId, Arc<dyn CommandClass>>,
    security: Option<Arc<dyn SecurityLayer>>,
}

impl ClassRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every built-in class.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for class in builtin::all() {
            registry.register(class);
        }
        registry
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(&mut self, class: Arc<dyn CommandClass>) -> Option<Arc<dyn CommandClass>> {
        debug!("registering command class 0x{:02X} ({})", class.id(), class.name());
        self.classes.insert(class.id(), class)
    }

    /// Install the security layer used for secure bindings.
    pub fn set_security(&mut self, layer: Arc<dyn SecurityLayer>) {
        self.security = Some(layer);
    }

    /// Whether a security layer is installed.
    pub fn has_security(&self) -> bool {
        self.security.is_some()
    }

    /// Handler for `id`.
    pub fn get(&self, id: ClassId) -> Option<&Arc<dyn CommandClass>> {
        self.classes.get(&id)
    }

    /// Whether a handler for `id` is registered.
    pub fn contains(&self, id: ClassId) -> bool {
        self.classes.contains_key(&id)
    }

    /// Registered class ids, ascending.
    pub fn ids(&self) -> Vec<ClassId> {
        let mut ids: Vec<_> = self.classes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn handler(&self, id: ClassId) -> ClassResult<&Arc<dyn CommandClass>> {
        self.classes.get(&id).ok_or(ClassError::UnknownClass(id))
    }

    /// Encode `verb` for a binding, wrapping it when the binding is secure.
    pub fn encode(
        &self,
        unit: UnitId,
        binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        let class = self.handler(binding.class)?;
        if !class.supports(verb) {
            return Err(class.unsupported(verb));
        }
        let mut command = class.encode_command(unit, binding, verb)?;
        if binding.secure {
            let security = self.security.as_ref().ok_or(ClassError::SecurityUnavailable)?;
            command.payload = security.wrap(unit, &command.payload)?;
            command.encapsulated = true;
        }
        Ok(command)
    }

    /// What the transaction manager waits for after sending `command`.
    pub fn expect_for(&self, command: &ClassCommand) -> Expect {
        match (command.reply, command.encapsulated, &self.security) {
            (None, _, _) => Expect::AckOnly,
            (Some((class, cmd)), false, _) => Expect::ClassReport { class, command: cmd },
            (Some(_), true, Some(security)) => {
                let (class, cmd) = security.encapsulation();
                Expect::ClassReport { class, command: cmd }
            }
            // Encapsulated commands are only produced with a layer installed.
            (Some((class, cmd)), true, None) => Expect::ClassReport { class, command: cmd },
        }
    }

    /// Strip encapsulation from a received payload.
    pub fn open(&self, unit: UnitId, bytes: &[u8]) -> ClassResult<OpenedPayload> {
        if let Some(security) = &self.security {
            let (class, cmd) = security.encapsulation();
            if bytes.len() >= 2 && bytes[0] == class && bytes[1] == cmd {
                let inner = security.unwrap(unit, bytes)?;
                trace!("unit {} secure payload opened: {} bytes", unit, inner.len());
                return Ok(OpenedPayload {
                    bytes: inner,
                    secure: true,
                });
            }
        }
        Ok(OpenedPayload {
            bytes: bytes.to_vec(),
            secure: false,
        })
    }

    /// Decode an opened report for a binding.
    ///
    /// Secure bindings only accept payloads that arrived encapsulated.
    pub fn decode(
        &self,
        unit: UnitId,
        binding: &CommandClassBinding,
        payload: &OpenedPayload,
    ) -> ClassResult<Update> {
        let class = self.handler(binding.class)?;
        if binding.secure && !payload.secure {
            return Err(ClassError::Security(format!(
                "unencapsulated {} report from secure unit {}",
                class.name(),
                unit
            )));
        }
        class.decode_report(unit, binding, &payload.bytes)
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassRegistry")
            .field("classes", &self.ids())
            .field("security", &self.security.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{CLASS_ASSOCIATION, CLASS_BINARY_SWITCH};
    use crate::value::FieldValue;

    /// XORs the body and prefixes a fixed header.
    struct XorLayer;

    impl SecurityLayer for XorLayer {
        fn encapsulation(&self) -> (ClassId, u8) {
            (0x98, 0x81)
        }

        fn wrap(&self, _unit: UnitId, payload: &[u8]) -> ClassResult<Vec<u8>> {
            let mut out = vec![0x98, 0x81];
            out.extend(payload.iter().map(|b| b ^ 0x5A));
            Ok(out)
        }

        fn unwrap(&self, _unit: UnitId, payload: &[u8]) -> ClassResult<Vec<u8>> {
            Ok(payload[2..].iter().map(|b| b ^ 0x5A).collect())
        }
    }

    #[test]
    fn test_builtin_registry_has_all_classes() {
        let registry = ClassRegistry::with_builtin();
        assert_eq!(
            registry.ids(),
            vec![0x25, 0x26, 0x30, 0x31, 0x70, 0x71, 0x84, 0x85]
        );
    }

    #[test]
    fn test_unknown_class() {
        let registry = ClassRegistry::new();
        let binding = CommandClassBinding::new(CLASS_BINARY_SWITCH, false);
        let err = registry.encode(2, &binding, &Verb::Get).unwrap_err();
        assert_eq!(err, ClassError::UnknownClass(CLASS_BINARY_SWITCH));
    }

    #[test]
    fn test_unsupported_verb() {
        let registry = ClassRegistry::with_builtin();
        let binding = CommandClassBinding::new(CLASS_ASSOCIATION, false);
        let err = registry
            .encode(2, &binding, &Verb::WakeUpIntervalGet)
            .unwrap_err();
        assert!(matches!(err, ClassError::Unsupported { .. }));
    }

    #[test]
    fn test_secure_binding_without_layer() {
        let registry = ClassRegistry::with_builtin();
        let binding = CommandClassBinding::new(CLASS_BINARY_SWITCH, true);
        let err = registry.encode(2, &binding, &Verb::Get).unwrap_err();
        assert_eq!(err, ClassError::SecurityUnavailable);
    }

    #[test]
    fn test_secure_binding_is_wrapped_and_opened() {
        let mut registry = ClassRegistry::with_builtin();
        registry.set_security(Arc::new(XorLayer));
        let binding = CommandClassBinding::new(CLASS_BINARY_SWITCH, true);

        let command = registry.encode(2, &binding, &Verb::Get).expect("should encode");
        assert!(command.encapsulated);
        assert_eq!(command.header(), Some((0x98, 0x81)));
        assert_eq!(
            registry.expect_for(&command),
            Expect::ClassReport {
                class: 0x98,
                command: 0x81
            }
        );

        let report = XorLayer.wrap(2, &[0x25, 0x03, 0xFF]).expect("should wrap");
        let opened = registry.open(2, &report).expect("should open");
        assert!(opened.secure);
        let update = registry.decode(2, &binding, &opened).expect("should decode");
        assert_eq!(update.values, vec![(0, FieldValue::Bool(true))]);
    }

    #[test]
    fn test_secure_binding_rejects_plain_report() {
        let mut registry = ClassRegistry::with_builtin();
        registry.set_security(Arc::new(XorLayer));
        let binding = CommandClassBinding::new(CLASS_BINARY_SWITCH, true);

        let opened = registry.open(2, &[0x25, 0x03, 0x00]).expect("should open");
        assert!(!opened.secure);
        assert!(matches!(
            registry.decode(2, &binding, &opened),
            Err(ClassError::Security(_))
        ));
    }

    #[test]
    fn test_register_replaces_handler() {
        let mut registry = ClassRegistry::with_builtin();
        let replaced = registry.register(Arc::new(crate::builtin::BinarySwitch));
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 8);
    }
}
