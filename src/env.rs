//! Environment resolution: tool paths, storage roots, correlation id, cancellation handle.
//!
//! `Environment` is built once per request and never mutated; no core operation
//! reads ambient process state (`env::var`, cwd, ...) once one has been resolved.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A cheaply-cloneable flag a caller can fire from another thread to abort
/// the next poll iteration of a long-running operation.
#[derive(Clone, Debug, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

fn next_correlation_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("avdcore-{pid}-{n}")
}

/// Paths to the five external tools the core shells out to.
#[derive(Clone, Debug)]
pub struct ToolPaths {
    pub adb: PathBuf,
    pub avdmanager: PathBuf,
    pub sdkmanager: PathBuf,
    pub emulator: PathBuf,
    pub qemu_img: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            adb: "adb".into(),
            avdmanager: "avdmanager".into(),
            sdkmanager: "sdkmanager".into(),
            emulator: "emulator".into(),
            qemu_img: "qemu-img".into(),
        }
    }
}

/// Immutable-per-request bag of tool paths, storage roots, and request context.
#[derive(Clone, Debug)]
pub struct Environment {
    pub tools: ToolPaths,
    pub avd_home: PathBuf,
    pub golden_home: PathBuf,
    pub sdk_root: PathBuf,
    pub config_template: Option<PathBuf>,
    pub correlation_id: String,
    pub cancel: CancellationHandle,
}

/// Builds an [`Environment`] from explicit overrides, environment variables,
/// then fixed defaults, in that priority order. Never fails: an unresolvable
/// tool is simply recorded by its bare name and left for the shell to find.
#[derive(Clone, Debug, Default)]
pub struct EnvironmentBuilder {
    adb: Option<PathBuf>,
    avdmanager: Option<PathBuf>,
    sdkmanager: Option<PathBuf>,
    emulator: Option<PathBuf>,
    qemu_img: Option<PathBuf>,
    avd_home: Option<PathBuf>,
    golden_home: Option<PathBuf>,
    sdk_root: Option<PathBuf>,
    config_template: Option<PathBuf>,
    correlation_id: Option<String>,
    cancel: Option<CancellationHandle>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adb(mut self, path: impl Into<PathBuf>) -> Self {
        self.adb = Some(path.into());
        self
    }

    pub fn avdmanager(mut self, path: impl Into<PathBuf>) -> Self {
        self.avdmanager = Some(path.into());
        self
    }

    pub fn sdkmanager(mut self, path: impl Into<PathBuf>) -> Self {
        self.sdkmanager = Some(path.into());
        self
    }

    pub fn emulator(mut self, path: impl Into<PathBuf>) -> Self {
        self.emulator = Some(path.into());
        self
    }

    pub fn qemu_img(mut self, path: impl Into<PathBuf>) -> Self {
        self.qemu_img = Some(path.into());
        self
    }

    pub fn avd_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.avd_home = Some(path.into());
        self
    }

    pub fn golden_home(mut self, path: impl Into<PathBuf>) -> Self {
        self.golden_home = Some(path.into());
        self
    }

    pub fn sdk_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.sdk_root = Some(path.into());
        self
    }

    pub fn config_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_template = Some(path.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn cancel(mut self, handle: CancellationHandle) -> Self {
        self.cancel = Some(handle);
        self
    }

    pub fn build(self) -> Environment {
        let home = dirs::home_dir();

        let default_avd_home = std::env::var_os("ANDROID_AVD_HOME")
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join(".android").join("avd")))
            .unwrap_or_else(|| PathBuf::from(".android/avd"));

        let default_golden_home = home
            .as_ref()
            .map(|h| h.join(".android").join("golden"))
            .unwrap_or_else(|| PathBuf::from(".android/golden"));

        let env_or = |var: &str, current: Option<PathBuf>, default: PathBuf| -> PathBuf {
            current
                .or_else(|| std::env::var_os(var).map(PathBuf::from))
                .unwrap_or(default)
        };

        let tools = ToolPaths {
            adb: env_or("AVDCORE_ADB", self.adb, "adb".into()),
            avdmanager: env_or("AVDCORE_AVDMANAGER", self.avdmanager, "avdmanager".into()),
            sdkmanager: env_or("AVDCORE_SDKMANAGER", self.sdkmanager, "sdkmanager".into()),
            emulator: env_or("AVDCORE_EMULATOR", self.emulator, "emulator".into()),
            qemu_img: env_or("AVDCORE_QEMU_IMG", self.qemu_img, "qemu-img".into()),
        };

        let avd_home = env_or("AVDCORE_AVD_HOME", self.avd_home, default_avd_home);
        let golden_home = env_or("AVDCORE_GOLDEN_HOME", self.golden_home, default_golden_home);

        let default_sdk_root = std::env::var_os("ANDROID_SDK_ROOT")
            .or_else(|| std::env::var_os("ANDROID_HOME"))
            .map(PathBuf::from)
            .or_else(|| home.as_ref().map(|h| h.join("Android").join("Sdk")))
            .unwrap_or_else(|| PathBuf::from("/opt/android-sdk"));
        let sdk_root = env_or("AVDCORE_SDK_ROOT", self.sdk_root, default_sdk_root);

        Environment {
            tools,
            avd_home,
            golden_home,
            sdk_root,
            config_template: self.config_template,
            correlation_id: self.correlation_id.unwrap_or_else(next_correlation_id),
            cancel: self.cancel.unwrap_or_default(),
        }
    }
}

impl Environment {
    /// Path to `<name>.avd` under the AVD home.
    pub fn avd_dir(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.avd"))
    }

    /// Path to `<name>.ini` under the AVD home.
    pub fn avd_ini(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{name}.ini"))
    }

    /// Path to the per-(name, port) interleaved log file under the host temp dir.
    pub fn log_path(&self, name: &str, port: u16) -> PathBuf {
        std::env::temp_dir().join(format!("emulator-{name}-{port}.log"))
    }

    pub fn golden_dir(&self, name: &str) -> PathBuf {
        self.golden_home.join(name)
    }
}

/// Returns true if `path`'s absolute form equals `other`'s, tolerating either
/// being relative (resolved against the current directory for comparison only).
pub fn same_path(path: &Path, other: &Path) -> bool {
    let canon = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    canon(path) == canon(other)
}
