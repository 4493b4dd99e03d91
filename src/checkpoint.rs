//! Architectural state of blocks saved by an earlier run.
//!
//! Threads are keyed by their index within the block and the block id,
//! shared memory by the block id alone.

use color_eyre::eyre::{self, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadState {
    pub registers: BTreeMap<String, u64>,
    pub local_memory: Vec<u8>,
}

pub trait Store: std::fmt::Debug {
    fn load_thread(
        &self,
        kernel_id: u64,
        thread_in_block: usize,
        block_id: u64,
    ) -> eyre::Result<Option<ThreadState>>;

    fn load_shared_memory(&self, kernel_id: u64, block_id: u64) -> eyre::Result<Option<Vec<u8>>>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemory {
    threads: HashMap<(u64, usize, u64), ThreadState>,
    shared_memory: HashMap<(u64, u64), Vec<u8>>,
}

impl InMemory {
    pub fn insert_thread(
        &mut self,
        kernel_id: u64,
        thread_in_block: usize,
        block_id: u64,
        state: ThreadState,
    ) {
        self.threads
            .insert((kernel_id, thread_in_block, block_id), state);
    }

    pub fn insert_shared_memory(&mut self, kernel_id: u64, block_id: u64, data: Vec<u8>) {
        self.shared_memory.insert((kernel_id, block_id), data);
    }
}

impl Store for InMemory {
    fn load_thread(
        &self,
        kernel_id: u64,
        thread_in_block: usize,
        block_id: u64,
    ) -> eyre::Result<Option<ThreadState>> {
        Ok(self
            .threads
            .get(&(kernel_id, thread_in_block, block_id))
            .cloned())
    }

    fn load_shared_memory(&self, kernel_id: u64, block_id: u64) -> eyre::Result<Option<Vec<u8>>> {
        Ok(self.shared_memory.get(&(kernel_id, block_id)).cloned())
    }
}

/// Checkpoint files in a directory.
///
/// `thread_<thread>_<block>.json` holds a [`ThreadState`],
/// `shared_mem_<block>.json` the shared memory contents of a block.
#[derive(Debug, Clone)]
pub struct Directory {
    pub path: PathBuf,
}

impl Directory {
    fn read<T>(&self, name: &str) -> eyre::Result<Option<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        let path = self.path.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        let file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("failed to open checkpoint {}", path.display()))?;
        let value = serde_json::from_reader(std::io::BufReader::new(file))
            .wrap_err_with(|| format!("failed to parse checkpoint {}", path.display()))?;
        Ok(Some(value))
    }
}

impl Store for Directory {
    fn load_thread(
        &self,
        _kernel_id: u64,
        thread_in_block: usize,
        block_id: u64,
    ) -> eyre::Result<Option<ThreadState>> {
        self.read(&format!("thread_{thread_in_block}_{block_id}.json"))
    }

    fn load_shared_memory(&self, _kernel_id: u64, block_id: u64) -> eyre::Result<Option<Vec<u8>>> {
        self.read(&format!("shared_mem_{block_id}.json"))
    }
}
