//! Device enumeration.

use tracing::debug;

use super::Engine;

/// Snapshot of the device URIs an engine reported.
///
/// Queried once per mount; an engine that reports nothing yields an empty
/// directory rather than an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDirectory {
    uris: Vec<String>,
}

impl DeviceDirectory {
    /// Query the engine for every enumerable device.
    pub fn query<E: Engine>(engine: &E) -> Self {
        let uris = engine.list_devices();
        debug!(count = uris.len(), "Listed devices");
        Self { uris }
    }

    pub fn from_uris(uris: Vec<String>) -> Self {
        Self { uris }
    }

    /// All URIs, in engine order.
    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn into_uris(self) -> Vec<String> {
        self.uris
    }

    /// URIs whose scheme names the given driver, e.g. `local-sync`.
    pub fn for_driver<'a>(&'a self, driver: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.uris
            .iter()
            .map(String::as_str)
            .filter(move |uri| driver_of(uri) == Some(driver))
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.uris.iter().any(|u| u == uri)
    }

    /// First listed device, if any.
    pub fn default_device(&self) -> Option<&str> {
        self.uris.first().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.uris.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }
}

/// Driver name of a device URI (`cuda://0` -> `cuda`).
pub fn driver_of(uri: &str) -> Option<&str> {
    uri.split_once("://").map(|(driver, _)| driver)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> DeviceDirectory {
        DeviceDirectory::from_uris(vec![
            "local-sync://".to_string(),
            "local-task://".to_string(),
            "cuda://GPU-0".to_string(),
            "cuda://GPU-1".to_string(),
        ])
    }

    #[test]
    fn test_for_driver() {
        let dir = directory();
        let cuda: Vec<&str> = dir.for_driver("cuda").collect();
        assert_eq!(cuda, vec!["cuda://GPU-0", "cuda://GPU-1"]);
        assert_eq!(dir.for_driver("local").count(), 0);
        assert_eq!(dir.for_driver("local-sync").count(), 1);
    }

    #[test]
    fn test_default_and_contains() {
        let dir = directory();
        assert_eq!(dir.default_device(), Some("local-sync://"));
        assert!(dir.contains("cuda://GPU-1"));
        assert!(!dir.contains("cuda://GPU-2"));
        assert_eq!(dir.len(), 4);
    }

    #[test]
    fn test_empty_directory() {
        let dir = DeviceDirectory::default();
        assert!(dir.is_empty());
        assert_eq!(dir.default_device(), None);
    }

    #[test]
    fn test_driver_of() {
        assert_eq!(driver_of("vulkan://0"), Some("vulkan"));
        assert_eq!(driver_of("not-a-uri"), None);
    }
}
