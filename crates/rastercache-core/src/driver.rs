//! Format drivers and their registry

use crate::dataset::Dataset;
use crate::pool::GlobalBlockPool;
use rastercache_common::{Access, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A storage format that can open files as datasets
pub trait Driver: Send + Sync {
    /// Short format name, unique within a registry
    fn name(&self) -> &'static str;

    /// Check whether `path` looks like this format, without opening it fully
    fn identify(&self, path: &Path) -> bool;

    /// Open `path`, caching its blocks in `pool`
    fn open(&self, path: &Path, access: Access, pool: Arc<GlobalBlockPool>) -> Result<Dataset>;
}

/// Ordered set of drivers; the first one that identifies a path opens it
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a driver, replacing any driver with the same name
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        self.drivers.retain(|d| d.name() != driver.name());
        debug!(driver = driver.name(), "registered driver");
        self.drivers.push(driver);
    }

    pub fn driver(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers
            .iter()
            .find(|d| d.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.drivers.iter().map(|d| d.name()).collect()
    }

    /// Open `path` with the first driver that identifies it
    pub fn open(&self, path: &Path, access: Access, pool: Arc<GlobalBlockPool>) -> Result<Dataset> {
        let driver = self
            .drivers
            .iter()
            .find(|d| d.identify(path))
            .ok_or_else(|| {
                Error::configuration(format!("no driver recognises {}", path.display()))
            })?;
        debug!(driver = driver.name(), path = %path.display(), "driver identified file");
        driver.open(path, access, pool)
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rastercache_common::{CacheConfig, DataType};

    struct ExtensionDriver(&'static str);

    impl Driver for ExtensionDriver {
        fn name(&self) -> &'static str {
            self.0
        }

        fn identify(&self, path: &Path) -> bool {
            path.extension().is_some_and(|e| e == self.0)
        }

        fn open(&self, path: &Path, _access: Access, pool: Arc<GlobalBlockPool>) -> Result<Dataset> {
            Dataset::create_mem(path.display().to_string(), 2, 2, 1, DataType::Byte, pool)
        }
    }

    #[test]
    fn test_open_picks_identifying_driver() {
        let mut registry = DriverRegistry::new();
        registry.register(Arc::new(ExtensionDriver("img")));
        registry.register(Arc::new(ExtensionDriver("dat")));
        registry.register(Arc::new(ExtensionDriver("img")));
        assert_eq!(registry.names(), ["dat", "img"]);
        assert!(registry.driver("IMG").is_some());

        let pool = Arc::new(GlobalBlockPool::new(CacheConfig::default()));
        let ds = registry
            .open(Path::new("scene.dat"), Access::ReadOnly, Arc::clone(&pool))
            .unwrap();
        assert_eq!(ds.description(), "scene.dat");
        assert!(matches!(
            registry.open(Path::new("scene.tif"), Access::ReadOnly, pool),
            Err(Error::Configuration(_))
        ));
    }
}
