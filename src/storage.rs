//! Image store: owns the on-disk layout of base AVDs, golden directories,
//! and clones. The clone step's prefer-template-then-stream-copy shape
//! mirrors the disk-provisioning idiom used elsewhere in this lineage
//! (template lookup, then a byte-for-byte copy, then a marker file to record
//! that the copy happened) adapted to a directory of named raw images
//! instead of a single formatted volume.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::sanitize;
use crate::tool;

/// The four writable raw disk images every AVD and golden directory share.
pub const WRITABLE_IMAGES: &[&str] = &["userdata-qemu.img", "encryptionkey.img", "cache.img", "sdcard.img"];

const CONFIG_FILE: &str = "config.ini";
const SNAPSHOTS_DIR: &str = "snapshots";
const CLONE_MARKER: &str = ".avdcore-clone";
const DEFAULT_SDCARD_SIZE_BYTES: u64 = 512 * 1024 * 1024;

/// An AVD's on-disk descriptor: its name and directory.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AvdDescriptor {
    pub name: String,
    pub dir: PathBuf,
}

fn io_err(path: impl Into<PathBuf>) -> impl Fn(io::Error) -> Error {
    let path = path.into();
    move |e| Error::io(path.clone(), e)
}

/// Strip a legacy `.qcow2` suffix from a golden path to obtain the directory.
pub fn golden_dir_from_legacy_path(path: &Path) -> PathBuf {
    match path.extension() {
        Some(ext) if ext == "qcow2" => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

/// Prefer the `.qcow2` overlay variant of `filename` in `dir` if present,
/// else the raw variant. Returns `None` if neither exists.
fn preferred_source(dir: &Path, filename: &str) -> Option<PathBuf> {
    let qcow2 = dir.join(format!("{filename}.qcow2"));
    if qcow2.is_file() {
        return Some(qcow2);
    }
    let raw = dir.join(filename);
    if raw.is_file() {
        return Some(raw);
    }
    None
}

fn check_system_image_installed(env: &Environment, image_id: &str) -> bool {
    let segments = image_id.split(';').collect::<Vec<_>>();
    let candidate: PathBuf = segments.iter().fold(env.sdk_root.join("system-images"), |acc, seg| acc.join(seg));
    candidate.is_dir()
}

/// Ensure `image_id` (e.g. `system-images;android-35;google_apis;x86_64`) is
/// installed, accepting licenses and invoking `sdk-manager` if absent.
pub fn ensure_system_image(env: &Environment, image_id: &str) -> Result<()> {
    if check_system_image_installed(env, image_id) {
        return Ok(());
    }
    tracing::info!(image = image_id, "system image absent, installing");
    tool::run_with_stdin(&env.tools.sdkmanager, &["--licenses"], "y", &env.correlation_id)?;
    tool::run(&env.tools.sdkmanager, &[image_id], &env.correlation_id)?;
    Ok(())
}

/// Initialize a base AVD: ensure the system image is present, then invoke
/// `avd-manager create` with `--force`, answering the custom-hardware-profile
/// prompt with a canned "no".
pub fn init_base(env: &Environment, name: &str, image_id: &str, device: &str) -> Result<AvdDescriptor> {
    if name.is_empty() {
        return Err(Error::precondition("AVD name must not be empty"));
    }

    ensure_system_image(env, image_id)?;

    tool::run_with_stdin(
        &env.tools.avdmanager,
        &["create", "avd", "-n", name, "-k", image_id, "-d", device, "--force"],
        "no",
        &env.correlation_id,
    )?;

    Ok(AvdDescriptor {
        name: name.to_string(),
        dir: env.avd_dir(name),
    })
}

/// Convert the writable images of the AVD at `source_dir` into raw format and
/// stage them under `dest`, atomically renaming each into place. `dest` may
/// be passed with a legacy `.qcow2` suffix, which is stripped to obtain the
/// directory. Returns the destination directory and total bytes written.
pub fn save_golden(env: &Environment, source_dir: &Path, dest: &Path) -> Result<(PathBuf, u64)> {
    let dest_dir = golden_dir_from_legacy_path(dest);
    fs::create_dir_all(&dest_dir).map_err(io_err(&dest_dir))?;

    let mut total = 0u64;
    for filename in WRITABLE_IMAGES {
        let Some(src) = preferred_source(source_dir, filename) else {
            continue;
        };
        let final_path = dest_dir.join(filename);
        let tmp_path = dest_dir.join(format!(".{filename}.tmp"));

        tool::run(
            &env.tools.qemu_img,
            &["convert", "-O", "raw", &src.to_string_lossy(), &tmp_path.to_string_lossy()],
            &env.correlation_id,
        )?;
        fs::rename(&tmp_path, &final_path).map_err(io_err(&final_path))?;
        total += fs::metadata(&final_path).map_err(io_err(&final_path))?.len();
    }

    Ok((dest_dir, total))
}

fn is_excluded_from_symlink_walk(file_name: &str) -> bool {
    if file_name == SNAPSHOTS_DIR || file_name == CONFIG_FILE {
        return true;
    }
    if file_name.starts_with("cache") || file_name.starts_with("userdata") || file_name.starts_with("encryptionkey") {
        return true;
    }
    if file_name.ends_with(".lock") {
        return true;
    }
    false
}

/// Walk `base_dir`, symlinking every read-only entry into `clone_dir`,
/// skipping the snapshot subtree, writable-image files, the config file, and
/// lock files.
fn symlink_readonly_tree(base_dir: &Path, clone_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(base_dir).map_err(io_err(base_dir))? {
        let entry = entry.map_err(io_err(base_dir))?;
        let file_name = entry.file_name();
        let file_name_str = file_name.to_string_lossy();
        if is_excluded_from_symlink_walk(&file_name_str) {
            continue;
        }

        let src = entry.path();
        let dst = clone_dir.join(&file_name);
        let meta = entry.file_type().map_err(io_err(&src))?;

        if meta.is_dir() {
            fs::create_dir_all(&dst).map_err(io_err(&dst))?;
            symlink_readonly_tree(&src, &dst)?;
        } else {
            let absolute_src = src.canonicalize().unwrap_or(src);
            match symlink(&absolute_src, &dst) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::io(dst, e)),
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(not(unix))]
fn symlink(src: &Path, dst: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks unsupported on this platform"))
}

/// Stream-copy `src` to `dst` without reading the whole file into memory.
fn stream_copy(src: &Path, dst: &Path) -> Result<u64> {
    let mut reader = fs::File::open(src).map_err(io_err(src))?;
    let mut writer = fs::File::create(dst).map_err(io_err(dst))?;
    io::copy(&mut reader, &mut writer).map_err(io_err(dst))
}

/// Create a raw sdcard image of `size_bytes` by extending a sparse file;
/// falls back to `qemu-img create` if the sparse allocation fails.
fn synthesize_sdcard(env: &Environment, path: &Path, size_bytes: u64) -> Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let sparse_result = (|| -> io::Result<()> {
        let mut file = fs::OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        if size_bytes > 0 {
            file.seek(SeekFrom::Start(size_bytes - 1))?;
            file.write_all(&[0u8])?;
        }
        file.sync_all()
    })();

    if sparse_result.is_ok() {
        return Ok(());
    }

    tracing::debug!(path = %path.display(), "sparse sdcard allocation failed, falling back to qemu-img create");
    tool::run(
        &env.tools.qemu_img,
        &["create", "-f", "raw", &path.to_string_lossy(), &size_bytes.to_string()],
        &env.correlation_id,
    )?;
    Ok(())
}

fn remove_stray_snapshots_and_overlays(clone_dir: &Path) -> Result<()> {
    let snapshots = clone_dir.join(SNAPSHOTS_DIR);
    if snapshots.exists() {
        fs::remove_dir_all(&snapshots).map_err(io_err(&snapshots))?;
    }
    for entry in fs::read_dir(clone_dir).map_err(io_err(clone_dir))? {
        let entry = entry.map_err(io_err(clone_dir))?;
        let path = entry.path();
        if path.extension().map(|e| e == "qcow2").unwrap_or(false) {
            fs::remove_file(&path).map_err(io_err(&path))?;
        }
    }
    Ok(())
}

fn write_ini_pointer(env: &Environment, name: &str, clone_dir: &Path) -> Result<()> {
    let ini_path = env.avd_ini(name);
    let absolute = clone_dir.canonicalize().unwrap_or_else(|_| clone_dir.to_path_buf());
    let body = format!(
        "avd.ini.encoding=UTF-8\npath={}\npath.rel=avd/{name}.avd\n",
        absolute.display()
    );
    fs::write(&ini_path, body).map_err(io_err(&ini_path))
}

fn stat_userdata_image(clone_dir: &Path) -> Result<(PathBuf, u64)> {
    for candidate in ["userdata-qemu.img", "userdata-qemu.img.qcow2"] {
        let path = clone_dir.join(candidate);
        if let Ok(meta) = fs::metadata(&path) {
            return Ok((path, meta.len()));
        }
    }
    Err(Error::not_found(format!(
        "no userdata image found in {}",
        clone_dir.display()
    )))
}

/// Clone an AVD from `base_name`'s directory and a golden directory.
///
/// Preconditions: the base AVD directory exists; `clone_name` does not
/// collide with a currently running emulator (callers must check discovery
/// before calling this — the image store itself only checks the filesystem
/// collision, not liveness).
pub fn clone_from_golden(
    env: &Environment,
    base_name: &str,
    clone_name: &str,
    golden_dir: &Path,
    template: Option<&Path>,
) -> Result<(PathBuf, u64)> {
    let base_dir = env.avd_dir(base_name);
    if !base_dir.is_dir() {
        return Err(Error::precondition(format!(
            "base AVD directory {} does not exist",
            base_dir.display()
        )));
    }

    let clone_dir = env.avd_dir(clone_name);
    fs::create_dir_all(&clone_dir).map_err(io_err(&clone_dir))?;

    let config_source_path = template.unwrap_or(&base_dir).join(CONFIG_FILE);
    let config_source = if template.is_some() && template.unwrap().is_file() {
        fs::read_to_string(template.unwrap()).map_err(io_err(template.unwrap()))?
    } else {
        fs::read_to_string(&config_source_path).map_err(io_err(&config_source_path))?
    };
    let sanitized = sanitize::sanitize(&config_source);
    let final_config = sanitize::force_raw_userdata(&sanitized);
    let config_dst = clone_dir.join(CONFIG_FILE);
    fs::write(&config_dst, final_config).map_err(io_err(&config_dst))?;

    symlink_readonly_tree(&base_dir, &clone_dir)?;

    for filename in WRITABLE_IMAGES {
        let src = golden_dir.join(filename);
        if !src.is_file() {
            continue;
        }
        let dst = clone_dir.join(filename);
        stream_copy(&src, &dst)?;
    }

    let sdcard_dst = clone_dir.join("sdcard.img");
    if !sdcard_dst.is_file() {
        synthesize_sdcard(env, &sdcard_dst, DEFAULT_SDCARD_SIZE_BYTES)?;
    }

    remove_stray_snapshots_and_overlays(&clone_dir)?;
    write_ini_pointer(env, clone_name, &clone_dir)?;

    let marker = clone_dir.join(CLONE_MARKER);
    fs::write(&marker, base_name).map_err(io_err(&marker))?;

    stat_userdata_image(&clone_dir)
}

/// Best-effort delete of an AVD's directory and pointer file. Each removal
/// is independent and tolerates the other half having been removed already,
/// so calling this twice for the same name is a no-op the second time.
pub fn delete_avd(env: &Environment, name: &str) -> Result<()> {
    let dir = env.avd_dir(name);
    let ini = env.avd_ini(name);
    if dir.exists() {
        fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
    }
    if ini.exists() {
        fs::remove_file(&ini).map_err(io_err(&ini))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_env(root: &Path) -> Environment {
        crate::env::EnvironmentBuilder::new()
            .avd_home(root.join("avd"))
            .golden_home(root.join("golden"))
            .build()
    }

    fn write_file(path: &Path, contents: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn golden_dir_from_legacy_path_strips_qcow2_suffix() {
        assert_eq!(golden_dir_from_legacy_path(Path::new("/g/base-a35.qcow2")), PathBuf::from("/g/base-a35"));
        assert_eq!(golden_dir_from_legacy_path(Path::new("/g/base-a35")), PathBuf::from("/g/base-a35"));
    }

    #[test]
    fn excludes_snapshot_and_writable_images_and_config_and_locks() {
        assert!(is_excluded_from_symlink_walk("snapshots"));
        assert!(is_excluded_from_symlink_walk("config.ini"));
        assert!(is_excluded_from_symlink_walk("userdata-qemu.img"));
        assert!(is_excluded_from_symlink_walk("cache.img"));
        assert!(is_excluded_from_symlink_walk("encryptionkey.img"));
        assert!(is_excluded_from_symlink_walk("hardware-qemu.ini.lock"));
        assert!(!is_excluded_from_symlink_walk("system.img"));
    }

    #[test]
    fn clone_from_golden_produces_symlinked_readonly_tree_and_copied_writables() {
        let tmp = TempDir::new().unwrap();
        let env = make_env(tmp.path());

        let base_dir = env.avd_dir("base");
        write_file(&base_dir.join("config.ini"), b"hw.device.name=pixel\nquickboot-mode=1\n");
        write_file(&base_dir.join("system.img"), b"readonly-system-image");
        write_file(&base_dir.join("userdata-qemu.img"), b"stale-base-userdata");

        let golden_dir = env.golden_dir("base");
        write_file(&golden_dir.join("userdata-qemu.img"), b"golden-userdata-bytes");
        write_file(&golden_dir.join("cache.img"), b"golden-cache-bytes");

        let (userdata_path, size) = clone_from_golden(&env, "base", "clone-a", &golden_dir, None).unwrap();
        assert!(userdata_path.ends_with("userdata-qemu.img"));
        assert_eq!(size, "golden-userdata-bytes".len() as u64);

        let clone_dir = env.avd_dir("clone-a");
        assert_eq!(fs::read(clone_dir.join("userdata-qemu.img")).unwrap(), b"golden-userdata-bytes");
        assert_eq!(fs::read(clone_dir.join("cache.img")).unwrap(), b"golden-cache-bytes");

        let linked = fs::read_link(clone_dir.join("system.img")).unwrap();
        assert_eq!(fs::read(&linked).unwrap(), b"readonly-system-image");

        let config = fs::read_to_string(clone_dir.join("config.ini")).unwrap();
        assert!(!config.contains("quickboot-mode"));
        assert!(config.contains("fastboot.forceColdBoot=yes"));
        assert!(config.contains("userdata.useQcow2=no"));

        assert!(clone_dir.join(CLONE_MARKER).is_file());

        let ini = fs::read_to_string(env.avd_ini("clone-a")).unwrap();
        assert!(ini.contains("avd.ini.encoding=UTF-8"));
        assert!(ini.contains("path.rel=avd/clone-a.avd"));
    }

    #[test]
    fn clone_from_golden_rejects_missing_base() {
        let tmp = TempDir::new().unwrap();
        let env = make_env(tmp.path());
        let golden_dir = env.golden_dir("nonexistent");
        let err = clone_from_golden(&env, "nonexistent", "clone-a", &golden_dir, None).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn clone_twice_with_same_golden_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let env = make_env(tmp.path());
        let base_dir = env.avd_dir("base");
        write_file(&base_dir.join("config.ini"), b"hw.device.name=pixel\n");
        let golden_dir = env.golden_dir("base");
        write_file(&golden_dir.join("userdata-qemu.img"), b"golden-bytes");

        let first = clone_from_golden(&env, "base", "clone-a", &golden_dir, None).unwrap();
        let second = clone_from_golden(&env, "base", "clone-a", &golden_dir, None).unwrap();
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn delete_avd_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let env = make_env(tmp.path());
        let base_dir = env.avd_dir("base");
        write_file(&base_dir.join("config.ini"), b"hw.device.name=pixel\n");
        let golden_dir = env.golden_dir("base");
        write_file(&golden_dir.join("userdata-qemu.img"), b"golden-bytes");
        clone_from_golden(&env, "base", "clone-a", &golden_dir, None).unwrap();

        delete_avd(&env, "clone-a").unwrap();
        assert!(!env.avd_dir("clone-a").exists());
        delete_avd(&env, "clone-a").unwrap();
    }
}
