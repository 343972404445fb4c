use anyhow::{anyhow, bail, Context};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/rapor.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
const WORKSPACE_DB_FILE: &str = "rapor.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "rapor-workspace-v1";
pub const LEGACY_SQLITE_FORMAT: &str = "legacy-sqlite3";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    /// Present when the bundle carried a checksum and it matched.
    pub verified_sha256: Option<String>,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.to_string_lossy()))?;
    Ok(hex(&hasher.finalize()))
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(WORKSPACE_DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let db_sha256 = sha256_file(&db_path)?;
    let db_size = std::fs::metadata(&db_path)
        .with_context(|| format!("failed to stat {}", db_path.to_string_lossy()))?
        .len();

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339(),
        "db": {
            "entry": DB_ENTRY,
            "sha256": db_sha256,
            "size": db_size,
        },
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    let workspace_meta = json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
    });
    zip.start_file(META_WORKSPACE_ENTRY, opts)
        .context("failed to start workspace metadata entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&workspace_meta)
            .context("failed to serialize workspace metadata")?
            .as_bytes(),
    )
    .context("failed to write workspace metadata entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    info!(
        out = %out_path.display(),
        db_bytes = db_size,
        sha256 = %db_sha256,
        "workspace bundle exported"
    );
    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        db_sha256,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(WORKSPACE_DB_FILE);

    if !is_zip_file(in_path)? {
        if !has_sqlite_header(in_path)? {
            bail!(
                "not a workspace bundle or sqlite database: {}",
                in_path.to_string_lossy()
            );
        }
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "failed to copy legacy sqlite backup from {} to {}",
                in_path.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
        info!(src = %in_path.display(), "legacy sqlite backup restored");
        return Ok(ImportSummary {
            bundle_format_detected: LEGACY_SQLITE_FORMAT.to_string(),
            verified_sha256: None,
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected_sha = manifest
        .pointer("/db/sha256")
        .and_then(|v| v.as_str())
        .map(|s| s.to_ascii_lowercase());

    let tmp_dst = workspace_path.join("rapor.sqlite3.importing");
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }

    let mut db_out = File::create(&tmp_dst).with_context(|| {
        format!(
            "failed to create temp database {}",
            tmp_dst.to_string_lossy()
        )
    })?;
    let mut hasher = Sha256::new();
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/rapor.sqlite3")?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = db_entry
                .read(&mut buf)
                .context("failed to extract database entry")?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            db_out
                .write_all(&buf[..n])
                .context("failed to write temp database")?;
        }
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;
    drop(db_out);

    let actual_sha = hex(&hasher.finalize());
    if let Some(expected) = expected_sha.as_deref() {
        if expected != actual_sha {
            let _ = std::fs::remove_file(&tmp_dst);
            warn!(expected, actual = %actual_sha, "bundle checksum mismatch");
            bail!(
                "database checksum mismatch: manifest {} but entry hashes to {}",
                expected,
                actual_sha
            );
        }
    }

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&tmp_dst, &dst).with_context(|| {
        format!(
            "failed to move extracted database to {}",
            dst.to_string_lossy()
        )
    })?;

    info!(src = %in_path.display(), verified = expected_sha.is_some(), "workspace bundle imported");
    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        verified_sha256: expected_sha.map(|_| actual_sha),
    })
}

fn read_prefix(path: &Path, buf: &mut [u8]) -> anyhow::Result<usize> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = f
            .read(&mut buf[filled..])
            .context("failed to read file signature")?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut sig = [0u8; 4];
    let read = read_prefix(path, &mut sig)?;
    Ok(read == 4 && sig == [0x50, 0x4B, 0x03, 0x04])
}

fn has_sqlite_header(path: &Path) -> anyhow::Result<bool> {
    let mut sig = [0u8; 16];
    let read = read_prefix(path, &mut sig)?;
    Ok(read == 16 && &sig == SQLITE_MAGIC)
}
