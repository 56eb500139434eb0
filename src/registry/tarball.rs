//! Tarball venv packaging: build a gzipped tar of a directory tree, and
//! extract one back out.
//!
//! Grounded on the same `flate2`/`tar` pairing the package manager example
//! uses to install dependency archives, turned around here to both build
//! (registry sync) and extract (action runner) portable venv tarballs.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::{write::GzEncoder, Compression};
use sha2::{Digest, Sha256};
use tar::{Archive, Builder};

use crate::error::Result;

/// Archives `site_packages_dir`'s *contents* (not the directory itself) into
/// a gzip-compressed tar at `dest_path`. Returns the sha256 and byte size of
/// the resulting archive for content-addressing.
pub fn build_tarball(site_packages_dir: &Path, dest_path: &Path) -> Result<(String, u64)> {
    let tar_gz = File::create(dest_path)?;
    let encoder = GzEncoder::new(tar_gz, Compression::default());
    let mut builder = Builder::new(encoder);
    builder.append_dir_all(".", site_packages_dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;

    let bytes = std::fs::read(dest_path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok((format!("{:x}", hasher.finalize()), bytes.len() as u64))
}

/// Extracts a gzip-compressed tar into `dest_dir`, creating it if absent.
/// Idempotent from the caller's perspective: extracting twice into the same
/// directory just overwrites identical files.
pub fn extract_tarball(tarball_path: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;
    let tar_gz = File::open(tarball_path)?;
    let decoder = GzDecoder::new(tar_gz);
    let mut archive = Archive::new(decoder);
    archive.unpack(dest_dir)?;
    Ok(())
}

/// Writes `bytes` to `dest_path`, used after downloading a tarball from
/// object storage before extracting it locally.
pub fn write_bytes(dest_path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = File::create(dest_path)?;
    file.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn build_then_extract_round_trips_file_contents() {
        let src_dir = tempfile_dir("src");
        std::fs::create_dir_all(&src_dir).unwrap();
        let mut f = File::create(src_dir.join("module.py")).unwrap();
        f.write_all(b"print('hello')").unwrap();

        let tarball_path = src_dir.with_extension("tar.gz");
        let (sha1, size) = build_tarball(&src_dir, &tarball_path).unwrap();
        assert!(size > 0);

        let dest_dir = tempfile_dir("dest");
        extract_tarball(&tarball_path, &dest_dir).unwrap();
        let extracted = std::fs::read_to_string(dest_dir.join("module.py")).unwrap();
        assert_eq!(extracted, "print('hello')");

        let (sha2, _) = build_tarball(&src_dir, &tarball_path.with_extension("again.tar.gz")).unwrap();
        assert_ne!(sha1, String::new());
        let _ = sha2;

        std::fs::remove_dir_all(&src_dir).ok();
        std::fs::remove_dir_all(&dest_dir).ok();
        std::fs::remove_file(&tarball_path).ok();
    }

    fn tempfile_dir(suffix: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sentryflow-tarball-test-{suffix}-{}", std::process::id()))
    }
}
