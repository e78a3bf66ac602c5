// ABOUTME: Output sink that dump files are written into
// ABOUTME: Files are staged in temporaries and only appear under their final name once complete

use anyhow::{Context, Result};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// One output file being written
pub trait SinkFile: Send {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Payload bytes written so far
    fn bytes_written(&self) -> u64;

    /// Publish the file under its final name
    fn finish(self: Box<Self>) -> Result<PathBuf>;

    /// Drop the file without publishing it
    fn discard(self: Box<Self>) -> Result<()>;
}

/// Destination for dump files
pub trait FileSink: Send + Sync {
    fn open(&self, name: &str) -> Result<Box<dyn SinkFile>>;
}

/// Writes every file into one directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    /// Creates the directory if needed
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create output directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl FileSink for DirectorySink {
    fn open(&self, name: &str) -> Result<Box<dyn SinkFile>> {
        let tmp = NamedTempFile::new_in(&self.root).with_context(|| {
            format!(
                "Failed to create temporary file for {} in {}",
                name,
                self.root.display()
            )
        })?;
        Ok(Box::new(DirectoryFile {
            target: self.root.join(name),
            writer: BufWriter::new(tmp),
            written: 0,
        }))
    }
}

struct DirectoryFile {
    target: PathBuf,
    writer: BufWriter<NamedTempFile>,
    written: u64,
}

impl SinkFile for DirectoryFile {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .with_context(|| format!("Failed to write {}", self.target.display()))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    fn finish(self: Box<Self>) -> Result<PathBuf> {
        let DirectoryFile { target, writer, .. } = *self;
        let tmp = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("Failed to flush {}", target.display()))?;
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("Failed to sync {}", target.display()))?;
        tmp.persist(&target)
            .with_context(|| format!("Failed to persist {}", target.display()))?;
        Ok(target)
    }

    fn discard(self: Box<Self>) -> Result<()> {
        let DirectoryFile { target, writer, .. } = *self;
        let tmp = writer.into_inner().map_err(|e| e.into_error())?;
        tmp.close()
            .with_context(|| format!("Failed to remove temporary file for {}", target.display()))
    }
}
