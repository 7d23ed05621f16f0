use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::detect::result::RawDetection;
use crate::frame::Frame;

use super::backend::DetectorBackend;

type Slot = Mutex<Box<dyn DetectorBackend>>;

/// Named detector backends in registration order.
///
/// Each backend sits behind its own `Mutex` because `DetectorBackend::detect`
/// takes `&mut self`. The first registered backend is the default unless
/// `set_default` picks another.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<(String, Slot)>,
    default_index: usize,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend. A backend with the same name is replaced in place.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        let slot = Mutex::new(Box::new(backend) as Box<dyn DetectorBackend>);
        match self.backends.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = slot,
            None => self.backends.push((name, slot)),
        }
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        self.default_index = self
            .position(name)
            .ok_or_else(|| anyhow!("backend '{}' not registered", name))?;
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.backends
            .get(self.default_index)
            .map(|(name, _)| name.as_str())
    }

    /// Registered backend names, in registration order.
    pub fn list(&self) -> Vec<String> {
        self.backends.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|(n, _)| n == name)
    }

    /// Warm up every backend once, before the first frame.
    pub fn warm_up(&self) -> Result<()> {
        for (name, slot) in &self.backends {
            let mut backend = slot.lock().map_err(|_| anyhow!("backend lock poisoned"))?;
            backend.warm_up()?;
            log::debug!("detector backend '{}' ready", name);
        }
        Ok(())
    }

    /// Run the default backend on a frame.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let (_, slot) = self
            .backends
            .get(self.default_index)
            .ok_or_else(|| anyhow!("no detector backend registered"))?;
        let mut backend = slot.lock().map_err(|_| anyhow!("backend lock poisoned"))?;
        backend.detect(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;
    use crate::geometry::Rect;

    struct PeopleOnly;

    impl DetectorBackend for PeopleOnly {
        fn name(&self) -> &'static str {
            "people-only"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>> {
            Ok(vec![RawDetection::person(Rect::new(0, 0, 4, 4), 0.9)])
        }
    }

    #[test]
    fn first_registered_backend_is_default() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(PeopleOnly);
        registry.register(StubBackend::new());
        assert_eq!(registry.default_name(), Some("people-only"));
        assert_eq!(registry.list(), vec!["people-only", "stub"]);

        registry.set_default("stub")?;
        assert_eq!(registry.default_name(), Some("stub"));
        assert!(registry.set_default("missing").is_err());
        Ok(())
    }

    #[test]
    fn detect_runs_the_default_backend() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(PeopleOnly);
        registry.register(StubBackend::new());

        let frame = Frame::filled(8, 8, [0, 0, 0], 0, 0);
        assert_eq!(registry.detect(&frame)?.len(), 1);

        registry.set_default("stub")?;
        assert!(registry.detect(&frame)?.is_empty());

        // Re-registering under the same name replaces the backend in place.
        registry.register(StubBackend::new().with_default(vec![RawDetection::object(24, Rect::new(1, 1, 2, 2), 0.5)]));
        assert_eq!(registry.list(), vec!["people-only", "stub"]);
        assert_eq!(registry.detect(&frame)?.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_registry_cannot_detect() {
        let registry = BackendRegistry::default();
        let frame = Frame::filled(2, 2, [0, 0, 0], 0, 0);
        assert!(registry.detect(&frame).is_err());
    }
}
