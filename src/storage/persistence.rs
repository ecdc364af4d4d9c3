//! Chain persistence
//!
//! The chain is stored as one JSON document. Every save writes a temporary
//! file and renames it over the previous one, so a crash leaves either the
//! old chain or the new chain on disk. The previous file is kept as a
//! rotating backup.

use crate::core::Block;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// On-disk format version
const CHAIN_FILE_VERSION: u32 = 1;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub chain_file: String,
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".zakat_ledger"),
            chain_file: "chain.json".to_string(),
            backup_enabled: true,
            max_backups: 5,
        }
    }
}

impl StorageConfig {
    /// Storage rooted at `data_dir` with default file names
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn wallets_dir(&self) -> PathBuf {
        self.data_dir.join("wallets")
    }
}

#[derive(Serialize)]
struct ChainFileRef<'a> {
    version: u32,
    blocks: Vec<&'a Block>,
}

#[derive(Deserialize)]
struct ChainFile {
    version: u32,
    blocks: Vec<Block>,
}

/// Chain storage manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn chain_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.chain_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.chain_file, index))
    }

    /// Write `blocks` followed by `candidate` as the new chain file
    ///
    /// Called before the candidate is appended in memory, so a failure here
    /// leaves both the file and the in-memory chain as they were.
    pub fn persist(&self, blocks: &[Block], candidate: &Block) -> Result<(), StorageError> {
        self.save(blocks.iter().chain(std::iter::once(candidate)))
    }

    /// Save the chain to disk
    pub fn save<'a>(&self, blocks: impl IntoIterator<Item = &'a Block>) -> Result<(), StorageError> {
        let path = self.chain_path();

        if self.config.backup_enabled && self.config.max_backups > 0 && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let document = ChainFileRef {
            version: CHAIN_FILE_VERSION,
            blocks: blocks.into_iter().collect(),
        };

        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.chain_file));
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        fs::rename(&temp_path, &path)?;
        log::debug!("Saved {} blocks to {}", document.blocks.len(), path.display());
        Ok(())
    }

    /// Load the persisted blocks, or `None` on first start
    pub fn load(&self) -> Result<Option<Vec<Block>>, StorageError> {
        let path = self.chain_path();
        if !path.exists() {
            return Ok(None);
        }
        read_chain_file(&path).map(Some)
    }

    pub fn exists(&self) -> bool {
        self.chain_path().exists()
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }

        Ok(())
    }

    /// Blocks from backup `index` (0 is the most recent)
    pub fn restore_backup(&self, index: usize) -> Result<Vec<Block>, StorageError> {
        let backup_path = self.backup_path(index);
        if !backup_path.exists() {
            return Err(StorageError::InvalidData(format!(
                "Backup {} not found",
                index
            )));
        }
        read_chain_file(&backup_path)
    }

    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    pub fn stats(&self) -> Result<StorageStats, StorageError> {
        let path = self.chain_path();
        let file_size = if path.exists() {
            fs::metadata(&path)?.len()
        } else {
            0
        };

        Ok(StorageStats {
            file_size,
            backup_count: self.list_backups().len(),
            data_dir: self.config.data_dir.clone(),
        })
    }
}

/// Storage statistics
#[derive(Debug)]
pub struct StorageStats {
    pub file_size: u64,
    pub backup_count: usize,
    pub data_dir: PathBuf,
}

fn read_chain_file(path: &Path) -> Result<Vec<Block>, StorageError> {
    let file = fs::File::open(path)?;
    let document: ChainFile = serde_json::from_reader(BufReader::new(file))?;
    if document.version != CHAIN_FILE_VERSION {
        return Err(StorageError::InvalidData(format!(
            "Unsupported chain file version {}",
            document.version
        )));
    }
    Ok(document.blocks)
}
