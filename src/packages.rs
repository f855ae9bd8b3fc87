use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lazy_static::lazy_static;
use log::{debug, info};
use nix::unistd::getcwd;

const PACKAGE_DIR: &str = "dox_packages";

/// What `import` needs from a package store
pub trait Packages {
    fn is_installed(&self, name: &str) -> bool;

    /// Install `name` and whatever it depends on. May block.
    fn install(&mut self, name: &str) -> Result<()>;

    fn path_of(&self, name: &str) -> Option<PathBuf>;
}

pub struct PackageInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub dependencies: &'static [&'static str],
}

lazy_static! {
    /// Packages the simulated registry knows about
    pub static ref REGISTRY: Vec<PackageInfo> = vec![
        PackageInfo {
            name: "dox-web",
            version: "2.1.0",
            description: "Web framework for DoxRain",
            dependencies: &[],
        },
        PackageInfo {
            name: "dox-math",
            version: "1.5.2",
            description: "Mathematical operations library",
            dependencies: &[],
        },
        PackageInfo {
            name: "dox-http",
            version: "3.0.1",
            description: "HTTP client library",
            dependencies: &["dox-json"],
        },
        PackageInfo {
            name: "dox-json",
            version: "2.0.0",
            description: "JSON parsing and serialization",
            dependencies: &[],
        },
    ];
}

/// Local package store
///
/// Every subdirectory of the store directory is an installed package. Installing "downloads"
/// from `REGISTRY` by creating the package directory after a fixed delay.
pub struct PackageManager {
    dir: PathBuf,
    delay: Duration,
    installed: BTreeMap<String, PathBuf>,
}

impl PackageManager {
    pub fn new<P: Into<PathBuf>>(dir: P, delay: Duration) -> Result<Self> {
        let dir = dir.into();
        let mut installed = BTreeMap::new();

        if dir.is_dir() {
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read package directory {}", dir.display()))?;
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    debug!("Found installed package: {}", name);
                    installed.insert(name, entry.path());
                }
            }
        }

        Ok(Self {
            dir,
            delay,
            installed,
        })
    }

    /// `dox_packages` under the current working directory
    pub fn default_dir() -> Result<PathBuf> {
        let cwd = getcwd().context("Failed to get current directory")?;
        Ok(cwd.join(PACKAGE_DIR))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Packages for PackageManager {
    fn is_installed(&self, name: &str) -> bool {
        self.installed.contains_key(name)
    }

    fn install(&mut self, name: &str) -> Result<()> {
        let pkg = REGISTRY
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| anyhow!("Package {} not found in registry", name))?;

        info!("Installing {}@{} ({})", pkg.name, pkg.version, pkg.description);

        for dep in pkg.dependencies {
            if !self.is_installed(dep) {
                info!("Installing dependency: {}", dep);
                self.install(dep)?;
            }
        }

        let path = self.dir.join(pkg.name);
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        // Stands in for the download
        thread::sleep(self.delay);

        self.installed.insert(pkg.name.to_string(), path);
        info!("Successfully installed {}@{}", pkg.name, pkg.version);

        Ok(())
    }

    fn path_of(&self, name: &str) -> Option<PathBuf> {
        self.installed.get(name).cloned()
    }
}

#[test]
fn test_install_with_dependencies() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let store = dir.path().join(PACKAGE_DIR);
    let mut pm = PackageManager::new(&store, Duration::from_millis(0)).expect("Failed to open");

    assert!(!pm.is_installed("dox-http"));
    pm.install("dox-http").expect("Failed to install");

    assert!(pm.is_installed("dox-http"));
    assert!(pm.is_installed("dox-json"));
    assert_eq!(pm.path_of("dox-http"), Some(store.join("dox-http")));
    assert!(store.join("dox-json").is_dir());
    assert_eq!(pm.dir(), store.as_path());
}

#[test]
fn test_install_unknown() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut pm = PackageManager::new(dir.path(), Duration::from_millis(0)).expect("Failed to open");

    assert!(pm.install("dox-core").is_err());
    assert!(!pm.is_installed("dox-core"));
    assert_eq!(pm.path_of("dox-core"), None);
}

#[test]
fn test_existing_packages() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    fs::create_dir(dir.path().join("dox-math")).expect("Failed to create package");
    fs::write(dir.path().join("notes.txt"), "not a package").expect("Failed to write");

    let pm = PackageManager::new(dir.path(), Duration::from_millis(0)).expect("Failed to open");
    assert!(pm.is_installed("dox-math"));
    assert!(!pm.is_installed("notes.txt"));
    assert_eq!(pm.path_of("dox-math"), Some(dir.path().join("dox-math")));
}
