// vim: tw=80
//! Directed acyclic graphs of disk operations.
//!
//! Every access is carried out by one or more DAGs.  A DAG's nodes are stored
//! in an arena owned by the DAG and refer to each other by index, so the
//! whole graph is freed at once when the DAG is dropped.

use std::fmt;

use divbuf::DivBufShared;
use itertools::Itertools;

use crate::{
    disk::DiskSet,
    layout::Geometry,
    paritylog::{LogOp, ParityLogContext},
    stripe_map::{AccessStripeMapHeader, PhysDiskAddr},
    types::*,
    util::{AllocTracker, Tracked},
};

pub mod build;
mod engine;
mod funcs;
pub mod xor;

/// Index of a node within its DAG
pub type NodeId = usize;

/// Index of a buffer within its DAG
pub type BufId = usize;

/// Execution state of one node
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    /// Waiting for its antecedents
    Wait,
    /// Dispatched, but not yet complete
    Fired,
    Good,
    Bad,
    /// Never fired.  Not produced by the engine.
    Skipped,
    /// Its undo function is running
    Recover,
    /// Its undo function failed
    Panic,
    /// Successfully rolled back
    Undone,
}

/// Overall state of a DAG
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DagStatus {
    /// Normal execution
    Enable,
    /// A node failed after the commit point.  Remaining nodes execute as
    /// NOPs.
    RollForward,
    /// A node failed before the commit point.  No more nodes fire, and
    /// completed nodes are undone.
    RollBackward,
}

/// Placement rule of an XOR node's inputs within its result
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XorKind {
    /// The result is one whole stripe unit.  Each input lands at its own
    /// offset within the stripe unit.
    Regular,
    /// The inputs and the result all cover the same sectors
    Simple,
    /// The result is the failed unit's range.  Inputs are placed relative to
    /// the start of that range.
    Recovery { failed: PhysDiskAddr },
}

/// What a node does when it fires
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// Does nothing.  Used for block and commit points
    Nil,
    /// The terminal node.  Fails unless every commit node fired.
    Terminate,
    DiskRead { pda: PhysDiskAddr, buf: BufId },
    DiskWrite { pda: PhysDiskAddr, buf: BufId },
    Xor {
        kind: XorKind,
        inputs: Vec<(PhysDiskAddr, BufId)>,
        result: BufId
    },
    /// Append a parity update or overwrite to the parity log
    ParityLog { op: LogOp, pda: PhysDiskAddr, buf: BufId },
}

#[derive(Debug)]
pub struct DagNode {
    pub status: NodeStatus,
    pub kind: NodeKind,
    /// Short name, like "Rod" or "Wnp"
    pub name: &'static str,
    pub commit_node: bool,
    pub antecedents: Vec<NodeId>,
    pub succedents: Vec<NodeId>,
    pub num_ant_done: usize,
    pub num_succ_fired: usize,
    pub num_succ_done: usize,
    pub error: Option<Error>,
}

impl DagNode {
    fn new(kind: NodeKind, name: &'static str) -> Self {
        DagNode {
            status: NodeStatus::Wait,
            kind,
            name,
            commit_node: false,
            antecedents: Vec::new(),
            succedents: Vec::new(),
            num_ant_done: 0,
            num_succ_fired: 0,
            num_succ_done: 0,
            error: None
        }
    }
}

#[derive(Debug)]
pub struct DagHeader {
    pub status: DagStatus,
    /// Name of the construction function
    pub creator: &'static str,
    /// Root nodes
    pub succedents: Vec<NodeId>,
    pub num_commit_nodes: usize,
    pub num_commits: usize,
    /// Stripe maps created just for this DAG, freed along with it
    pub asm_list: Vec<AccessStripeMapHeader>,
    _tracked: Tracked,
}

/// Storage for the data a DAG operates on
pub enum DagBuf {
    /// Allocated for the DAG itself
    Owned(DivBufShared),
    /// Caller-supplied data.  Read-only.
    User(IoVec),
}

impl fmt::Debug for DagBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DagBuf::Owned(dbs) => write!(f, "Owned({})", dbs.len()),
            DagBuf::User(iovec) => write!(f, "User({})", iovec.len()),
        }
    }
}

#[derive(Debug)]
pub struct Dag {
    pub header: DagHeader,
    pub nodes: Vec<DagNode>,
    bufs: Vec<DagBuf>,
    /// Buffers holding the access's results, and their byte offsets within
    /// the caller's buffer
    outputs: Vec<(BufId, usize)>,
    terminal: Option<NodeId>,
    /// Nodes in the order they fired
    fire_order: Vec<NodeId>,
}

impl Dag {
    pub fn new(creator: &'static str, tracker: &AllocTracker) -> Self {
        Dag {
            header: DagHeader {
                status: DagStatus::Enable,
                creator,
                succedents: Vec::new(),
                num_commit_nodes: 0,
                num_commits: 0,
                asm_list: Vec::new(),
                _tracked: tracker.track()
            },
            nodes: Vec::new(),
            bufs: Vec::new(),
            outputs: Vec::new(),
            terminal: None,
            fire_order: Vec::new()
        }
    }

    pub fn add_buf(&mut self, buf: DagBuf) -> BufId {
        self.bufs.push(buf);
        self.bufs.len() - 1
    }

    /// Allocate a zero-filled buffer of `len` bytes
    pub fn alloc_buf(&mut self, len: usize) -> BufId {
        self.add_buf(DagBuf::Owned(DivBufShared::from(vec![0u8; len])))
    }

    pub fn add_node(&mut self, kind: NodeKind, name: &'static str) -> NodeId {
        self.nodes.push(DagNode::new(kind, name));
        self.nodes.len() - 1
    }

    /// Record that the contents of `buf` belong at `offset` bytes within the
    /// caller's buffer.
    pub fn add_output(&mut self, buf: BufId, offset: usize) {
        self.outputs.push((buf, offset));
    }

    pub fn add_root(&mut self, id: NodeId) {
        self.header.succedents.push(id);
    }

    /// Designate `id` as a commit node
    pub fn commit(&mut self, id: NodeId) {
        self.nodes[id].commit_node = true;
        self.header.num_commit_nodes += 1;
    }

    /// Make `to` depend on `from`
    pub fn link(&mut self, from: NodeId, to: NodeId) {
        self.nodes[from].succedents.push(to);
        self.nodes[to].antecedents.push(from);
    }

    /// Buffers holding the access's results, with their offsets in the
    /// caller's buffer
    pub fn outputs(&self) -> &[(BufId, usize)] {
        &self.outputs
    }

    pub fn set_terminal(&mut self, id: NodeId) {
        self.terminal = Some(id);
    }

    pub fn terminal(&self) -> Option<NodeId> {
        self.terminal
    }

    /// Get a read-only reference to a buffer.  Fails if a node is currently
    /// writing to it.
    pub fn buf_const(&self, id: BufId) -> Result<IoVec> {
        match self.bufs.get(id) {
            Some(DagBuf::Owned(dbs)) => dbs.try_const().map_err(|_| Error::EFAULT),
            Some(DagBuf::User(iovec)) => Ok(iovec.clone()),
            None => Err(Error::EFAULT)
        }
    }

    /// Get exclusive access to a buffer.  Fails if anything else references
    /// it.
    pub fn buf_mut(&self, id: BufId) -> Result<IoVecMut> {
        match self.bufs.get(id) {
            Some(DagBuf::Owned(dbs)) => dbs.try_mut().map_err(|_| Error::EFAULT),
            _ => Err(Error::EFAULT)
        }
    }

    /// Take ownership of one of the DAG's own buffers
    pub fn into_buf(mut self, id: BufId) -> Result<DivBufShared> {
        if id >= self.bufs.len() {
            return Err(Error::EFAULT);
        }
        match self.bufs.swap_remove(id) {
            DagBuf::Owned(dbs) => Ok(dbs),
            DagBuf::User(_) => Err(Error::EFAULT)
        }
    }

    /// Copy every output buffer into the caller's buffer.
    pub fn copy_outputs(&self, dst: &mut [u8]) -> Result<()> {
        for (buf, offset) in self.outputs.iter() {
            let src = self.buf_const(*buf)?;
            let d = dst.get_mut(*offset..*offset + src.len())
                .ok_or(Error::EINVAL)?;
            d.copy_from_slice(&src[..]);
        }
        Ok(())
    }

    /// Columns whose disks returned I/O errors
    pub fn bad_columns(&self) -> Vec<ColT> {
        self.nodes.iter()
            .filter(|n| n.status == NodeStatus::Bad &&
                        n.error == Some(Error::EIO))
            .filter_map(|n| match &n.kind {
                NodeKind::DiskRead{pda, ..} | NodeKind::DiskWrite{pda, ..} =>
                    Some(pda.col),
                _ => None
            }).unique()
            .collect()
    }

    /// Look up a node by its name.  The first match is returned.
    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name)
    }
}

/// DAGs that must execute one after another, all covering a single stripe
#[derive(Debug)]
pub struct DagList {
    pub dags: Vec<Dag>,
    pub stripe: StripeNumT,
}

impl DagList {
    /// Execute every DAG in order, stopping at the first failure
    pub async fn execute(&mut self, env: &DagEnv<'_>) -> Result<()> {
        for dag in self.dags.iter_mut() {
            dag.execute(env).await?;
        }
        Ok(())
    }
}

/// Everything a DAG needs from its array in order to execute
pub struct DagEnv<'a> {
    pub disks: &'a DiskSet,
    pub geom: &'a Geometry,
    pub parity_log: Option<&'a ParityLogContext>,
}
