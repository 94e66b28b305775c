//! Layer unpacking.
//!
//! Layers are applied bottom to top into one directory. Whiteout entries
//! (`.wh.<name>`, `.wh..wh..opq`) delete what lower layers put there.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use kiln_core::error::{KilnError, Result};
use tar::Archive;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Apply one layer blob (gzip-compressed or plain tar) onto `target_dir`.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    let file = File::open(layer_path).map_err(|e| {
        KilnError::ImageStoreError(format!(
            "layer file not found: {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    std::fs::create_dir_all(target_dir)?;

    let mut reader = BufReader::new(file);
    let mut magic = [0u8; 2];
    let gzipped = reader.read_exact(&mut magic).is_ok() && magic == [0x1f, 0x8b];
    // rewind: reopen rather than juggling the buffered prefix
    let file = File::open(layer_path)?;
    let reader: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    apply(reader, target_dir).map_err(|e| {
        KilnError::ImageStoreError(format!(
            "failed to extract {} into {}: {}",
            layer_path.display(),
            target_dir.display(),
            e
        ))
    })?;

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );
    Ok(())
}

fn apply(reader: impl Read, target_dir: &Path) -> std::io::Result<()> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let Some(relative) = sanitize(&path) else {
            tracing::warn!(path = %path.display(), "Skipping layer entry outside rootfs");
            continue;
        };

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if file_name == OPAQUE_WHITEOUT {
            let dir = target_dir.join(relative.parent().unwrap_or(Path::new("")));
            clear_dir(&dir)?;
            continue;
        }
        if let Some(hidden) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            let victim = target_dir
                .join(relative.parent().unwrap_or(Path::new("")))
                .join(hidden);
            remove_any(&victim)?;
            continue;
        }

        entry.unpack_in(target_dir)?;
    }
    Ok(())
}

/// Strip leading `/` and `./`; reject `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

fn clear_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            for entry in entries {
                remove_any(&entry?.path())?;
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Copy a directory tree, keeping symlinks as symlinks and preserving modes.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = src.symlink_metadata()?;
    std::fs::create_dir_all(dst)?;
    std::fs::set_permissions(dst, std::fs::Permissions::from_mode(meta.permissions().mode()))?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            let target = std::fs::read_link(&from)?;
            std::os::unix::fs::symlink(target, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            std::fs::copy(&from, &to)?;
        }
        // device nodes, fifos and sockets are left to the runtime's /dev
    }
    Ok(())
}
