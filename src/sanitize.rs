//! Pure textual transformation of an AVD's `config.ini` to guarantee
//! cold-boot semantics. No I/O; callers read the source file and write the
//! result themselves (the image store does this as part of cloning).

const DROPPED_KEYS: &[&str] = &["quickboot-mode", "snapshot-present"];
const DROPPED_PREFIXES: &[&str] = &["fastboot.", "disk.dataPartition.", "firstboot."];
const COW_USERDATA_KEY: &str = "userdata.useQcow2";

const CANONICAL_LINES: &[&str] = &[
    "quickboot-mode=no",
    "snapshot-present=no",
    "fastboot.forceColdBoot=yes",
    "userdata.useQcow2=yes",
];

fn key_of(line: &str) -> Option<&str> {
    line.split_once('=').map(|(k, _)| k.trim())
}

fn is_dropped(key: &str) -> bool {
    DROPPED_KEYS.contains(&key) || key == COW_USERDATA_KEY || DROPPED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Drop quickboot/snapshot/fastboot.*/disk.dataPartition.*/firstboot.* and the
/// copy-on-write-userdata key, then append the four canonical cold-boot lines:
/// quickboot disabled, snapshot not present, forced cold boot, and
/// copy-on-write userdata enabled.
/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)`.
pub fn sanitize(config: &str) -> String {
    let mut out: Vec<String> = config
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return true;
            }
            match key_of(trimmed) {
                Some(key) => !is_dropped(key),
                None => true,
            }
        })
        .map(|l| l.to_string())
        .collect();

    for canonical in CANONICAL_LINES {
        out.push(canonical.to_string());
    }

    let mut result = out.join("\n");
    result.push('\n');
    result
}

/// Ensure the clone declares raw (non-overlay) userdata images: if a line
/// setting `userdata.useQcow2` exists, replace it; otherwise append it.
pub fn force_raw_userdata(config: &str) -> String {
    const KEY: &str = "userdata.useQcow2";
    let mut found = false;
    let mut out: Vec<String> = config
        .lines()
        .map(|line| {
            if key_of(line.trim()) == Some(KEY) {
                found = true;
                format!("{KEY}=no")
            } else {
                line.to_string()
            }
        })
        .collect();

    if !found {
        out.push(format!("{KEY}=no"));
    }

    let mut result = out.join("\n");
    result.push('\n');
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_known_keys_and_prefixes() {
        let input = "hw.device.name=pixel\nquickboot-mode=1\nfastboot.forceColdBoot=no\ndisk.dataPartition.path=/foo\nfirstboot.something=1\nuserdata.useQcow2=no\n";
        let out = sanitize(input);
        assert!(out.contains("hw.device.name=pixel"));
        assert!(!out.contains("disk.dataPartition.path"));
        assert!(!out.contains("firstboot.something"));
        assert!(out.contains("fastboot.forceColdBoot=yes"));
        assert_eq!(out.matches("quickboot-mode").count(), 1);
        assert!(out.contains("quickboot-mode=no"));
        assert_eq!(out.matches("userdata.useQcow2").count(), 1);
        assert!(out.contains("userdata.useQcow2=yes"));
    }

    #[test]
    fn appends_canonical_lines_once_each() {
        let out = sanitize("hw.device.name=pixel\n");
        for line in CANONICAL_LINES {
            assert_eq!(out.matches(line).count(), 1);
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        let input = "hw.device.name=pixel\nquickboot-mode=1\n";
        let once = sanitize(input);
        let twice = sanitize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn force_raw_userdata_replaces_existing_line() {
        let input = "userdata.useQcow2=yes\nhw.device.name=pixel\n";
        let out = force_raw_userdata(input);
        assert!(out.contains("userdata.useQcow2=no"));
        assert!(!out.contains("userdata.useQcow2=yes"));
    }

    #[test]
    fn force_raw_userdata_appends_when_absent() {
        let out = force_raw_userdata("hw.device.name=pixel\n");
        assert!(out.contains("userdata.useQcow2=no"));
    }
}
