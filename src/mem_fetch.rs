use serde::{Deserialize, Serialize};

/// Size of the control header of a memory packet in bytes
pub const CONTROL_SIZE: u32 = 8;

/// Granularity of the sub partition address interleaving
pub const PARTITION_INTERLEAVING: u64 = 256;

#[derive(
    strum::Display, Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum AccessKind {
    #[strum(serialize = "R")]
    Read,
    #[strum(serialize = "W")]
    Write,
}

/// A memory access emitted by the execution engine.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct Access {
    pub addr: u64,
    pub kind: AccessKind,
    pub data_size: u32,
}

#[derive(strum::Display, Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Status {
    InCoreQueue,
    InInterconnToL2Queue,
    InL2Pipeline,
    InL2ToDramQueue,
    InDram,
    InDramToL2Queue,
    InL2ToInterconnQueue,
    InInterconnToCoreQueue,
}

/// A memory request or reply travelling between cores and memory.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct MemFetch {
    pub uid: u64,
    pub kernel_id: u64,
    /// global core id
    pub core_id: usize,
    pub cluster_id: usize,
    pub sub_partition_id: usize,
    pub access: Access,
    pub is_reply: bool,
    pub status: Status,
}

impl std::fmt::Display for MemFetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}@{}({:#x})",
            if self.is_reply { "REPLY:" } else { "" },
            self.access.kind,
            self.uid,
            self.access.addr,
        )
    }
}

/// Maps an address onto one of `num_sub_partitions` sub partitions.
#[must_use]
pub fn sub_partition_id(addr: u64, num_sub_partitions: usize) -> usize {
    ((addr / PARTITION_INTERLEAVING) % num_sub_partitions.max(1) as u64) as usize
}

impl MemFetch {
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.access.kind == AccessKind::Write
    }

    #[must_use]
    pub fn control_size(&self) -> u32 {
        CONTROL_SIZE
    }

    #[must_use]
    pub fn data_size(&self) -> u32 {
        self.access.data_size
    }

    /// Total packet size including the control header.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data_size() + self.control_size()
    }

    /// Size of the request packet sent from the core.
    ///
    /// Reads only carry the control header.
    #[must_use]
    pub fn request_size(&self) -> u32 {
        if self.is_write() {
            self.size()
        } else {
            self.control_size()
        }
    }

    /// Size of the reply packet sent back to the core.
    ///
    /// Writes are acknowledged with the control header only.
    #[must_use]
    pub fn response_size(&self) -> u32 {
        if self.is_write() {
            self.control_size()
        } else {
            self.size()
        }
    }

    pub fn set_reply(&mut self) {
        assert!(!self.is_reply, "{self} is already a reply");
        self.is_reply = true;
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }
}
