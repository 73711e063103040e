//! Packing declared outputs into artifact bytes and back onto disk.
//!
//! Archives are deterministic: entries sorted by path, zero mtimes and
//! owners, fixed modes. Equal output trees produce equal bytes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name used when a stdout-only artifact is materialized.
pub const STDOUT_ARTIFACT: &str = "stdout";

/// Result of collecting a stage's declared outputs.
#[derive(Debug, Default)]
pub struct PackedOutputs {
    pub archive: Vec<u8>,
    pub missing: Vec<String>,
}

/// Collect `outputs` (relative to `out_dir`) into a tar archive.
///
/// Directories are included recursively. Outputs that do not exist are
/// reported in `missing` rather than failing the pack.
pub fn pack_outputs(out_dir: &Path, outputs: &[String]) -> io::Result<PackedOutputs> {
    let mut names: Vec<&String> = outputs.iter().collect();
    names.sort();
    names.dedup();

    let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut missing = Vec::new();
    for name in names {
        let path = out_dir.join(name);
        if path.is_file() {
            files.push((PathBuf::from(name), path));
        } else if path.is_dir() {
            collect_dir(&path, Path::new(name), &mut files)?;
        } else {
            missing.push(name.clone());
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));

    let mut builder = tar::Builder::new(Vec::new());
    for (rel, abs) in &files {
        let data = fs::read(abs)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(if is_executable(abs) { 0o755 } else { 0o644 });
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, rel, data.as_slice())?;
    }
    let archive = builder.into_inner()?;

    Ok(PackedOutputs { archive, missing })
}

fn collect_dir(dir: &Path, rel: &Path, out: &mut Vec<(PathBuf, PathBuf)>) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let rel_child = rel.join(entry.file_name());
        if path.is_dir() {
            collect_dir(&path, &rel_child, out)?;
        } else if path.is_file() {
            out.push((rel_child, path));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

/// Write an artifact into `dest`.
///
/// Archives are unpacked; plain (stdout) artifacts are written to
/// `dest/stdout`.
pub fn materialize(artifact: &[u8], is_archive: bool, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    if is_archive {
        let mut archive = tar::Archive::new(artifact);
        archive.set_preserve_mtime(false);
        archive.unpack(dest)
    } else {
        fs::write(dest.join(STDOUT_ARTIFACT), artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "bee").unwrap();
        fs::write(dir.path().join("a.txt"), "ay").unwrap();

        let outputs = vec!["b.txt".to_string(), "a.txt".to_string()];
        let first = pack_outputs(dir.path(), &outputs).unwrap();
        let second = pack_outputs(dir.path(), &outputs).unwrap();
        assert!(first.missing.is_empty());
        assert_eq!(first.archive, second.archive);
    }

    #[test]
    fn missing_outputs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present"), "x").unwrap();
        let packed =
            pack_outputs(dir.path(), &["present".to_string(), "absent".to_string()]).unwrap();
        assert_eq!(packed.missing, vec!["absent".to_string()]);
    }

    #[test]
    fn directories_roundtrip_through_materialize() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("python/lib")).unwrap();
        fs::write(src.path().join("python/lib/mod.py"), "x = 1").unwrap();

        let packed = pack_outputs(src.path(), &["python".to_string()]).unwrap();
        let dest = tempfile::tempdir().unwrap();
        materialize(&packed.archive, true, dest.path()).unwrap();
        let got = fs::read_to_string(dest.path().join("python/lib/mod.py")).unwrap();
        assert_eq!(got, "x = 1");
    }

    #[test]
    fn stdout_artifact_written_as_file() {
        let dest = tempfile::tempdir().unwrap();
        materialize(b"hello\n", false, dest.path()).unwrap();
        let got = fs::read_to_string(dest.path().join(STDOUT_ARTIFACT)).unwrap();
        assert_eq!(got, "hello\n");
    }
}
