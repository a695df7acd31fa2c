// Directory-per-job persistence: uploads, scratch space and final artifacts.

use crate::artifacts::{INDEX_FILE, SPRITE_FILE};
use crate::pipeline::orchestrator::JobPaths;
use anyhow::{Context, Result};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const ALLOWED_EXTENSIONS: [&str; 5] = ["mp4", "mov", "webm", "avi", "mkv"];

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

pub fn is_allowed_video(filename: &str) -> bool {
    extension_of(filename)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Job ids become directory names; only accept what we could have generated.
pub fn is_safe_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Keep the original stem readable but strip anything path-like.
fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    upload_root: PathBuf,
    output_root: PathBuf,
    temp_root: PathBuf,
}

impl Storage {
    pub fn new(
        upload_root: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        temp_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            upload_root: upload_root.into(),
            output_root: output_root.into(),
            temp_root: temp_root.into(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.upload_root, &self.output_root, &self.temp_root] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    fn upload_dir(&self, job_id: &str) -> PathBuf {
        self.upload_root.join(job_id)
    }

    pub fn job_paths(&self, job_id: &str, video: PathBuf) -> JobPaths {
        JobPaths {
            video,
            temp_dir: self.temp_root.join(job_id),
            output_dir: self.output_root.join(job_id),
        }
    }

    /// Store an uploaded video under the job's upload directory.
    pub fn save_upload(&self, job_id: &str, filename: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.upload_dir(job_id);
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(sanitize_filename(filename));
        fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Locate the uploaded video of a job, if it is still on disk.
    pub fn find_video(&self, job_id: &str) -> Option<PathBuf> {
        WalkDir::new(self.upload_dir(job_id))
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .find(|p| p.to_str().map(is_allowed_video).unwrap_or(false))
    }

    pub fn sprite_path(&self, job_id: &str) -> PathBuf {
        self.output_root.join(job_id).join(SPRITE_FILE)
    }

    pub fn index_path(&self, job_id: &str) -> PathBuf {
        self.output_root.join(job_id).join(INDEX_FILE)
    }

    /// Remove every directory belonging to a job. Missing directories are fine.
    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        for dir in [
            self.upload_dir(job_id),
            self.temp_root.join(job_id),
            self.output_root.join(job_id),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir)
                    .with_context(|| format!("Failed to remove {}", dir.display()))?;
            }
        }
        Ok(())
    }

    /// Zip archive holding the sprite sheet and its index.
    pub fn bundle_zip(&self, job_id: &str) -> Result<Vec<u8>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        for (name, path) in [
            (SPRITE_FILE, self.sprite_path(job_id)),
            (INDEX_FILE, self.index_path(job_id)),
        ] {
            let bytes =
                fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            writer
                .start_file(name, options)
                .context("Failed to start zip entry")?;
            writer.write_all(&bytes)?;
        }

        let cursor = writer.finish().context("Failed to finish zip")?;
        Ok(cursor.into_inner())
    }
}
