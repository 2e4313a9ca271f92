// vim: tw=80
//! The DAG execution engine.
//!
//! Nodes fire once all of their antecedents have completed.  A node's work is
//! either synchronous, like XOR, or an enqueued disk operation whose
//! completion is delivered back to the engine as a future's output.  Either
//! way, completion flows through [`Dag::wake`], which may make more nodes
//! ready.

use std::collections::VecDeque;

use futures::{
    FutureExt,
    StreamExt,
    future::BoxFuture,
    stream::FuturesUnordered
};

use super::*;

/// The outcome of firing a node
pub(super) enum Fired {
    /// The node's work is already complete
    Done(Result<()>),
    /// The node's work will complete later
    Pending(BoxFuture<'static, Result<()>>),
}

impl From<Result<BoxFuture<'static, Result<()>>>> for Fired {
    fn from(r: Result<BoxFuture<'static, Result<()>>>) -> Self {
        match r {
            Ok(fut) => Fired::Pending(fut),
            Err(e) => Fired::Done(Err(e))
        }
    }
}

impl Dag {
    /// Execute the DAG to completion.
    ///
    /// Succeeds only if no node failed and the terminal node completed.
    #[tracing::instrument(skip(self, env), fields(creator = self.header.creator))]
    pub async fn execute(&mut self, env: &DagEnv<'_>) -> Result<()> {
        let mut ready = self.header.succedents.iter()
            .copied()
            .collect::<VecDeque<_>>();
        let mut pending = FuturesUnordered::new();
        loop {
            while let Some(id) = ready.pop_front() {
                match self.fire(id, env) {
                    Fired::Done(r) => self.wake(id, r, &mut ready),
                    Fired::Pending(fut) => {
                        pending.push(fut.map(move |r| (id, r)));
                    }
                }
            }
            match pending.next().await {
                Some((id, r)) => self.wake(id, r, &mut ready),
                None => break
            }
        }
        if self.header.status == DagStatus::RollBackward {
            self.rollback();
        }
        self.result()
    }

    fn fire(&mut self, id: NodeId, env: &DagEnv<'_>) -> Fired {
        let enabled = self.header.status == DagStatus::Enable;
        let node = &mut self.nodes[id];
        debug_assert_eq!(node.status, NodeStatus::Wait);
        node.status = NodeStatus::Fired;
        if node.commit_node && enabled {
            self.header.num_commits += 1;
        }
        for a in self.nodes[id].antecedents.clone() {
            self.nodes[a].num_succ_fired += 1;
        }
        self.fire_order.push(id);
        self.do_func(id, enabled, env)
    }

    /// Record a node's completion and fire any succedents that are now ready.
    fn wake(&mut self, id: NodeId, r: Result<()>, ready: &mut VecDeque<NodeId>)
    {
        let node = &mut self.nodes[id];
        match r {
            Ok(()) => node.status = NodeStatus::Good,
            Err(e) => {
                tracing::warn!(node = node.name, error = ?e, "DAG node failed");
                node.status = NodeStatus::Bad;
                node.error = Some(e);
                if self.header.status == DagStatus::Enable {
                    self.header.status = if self.header.num_commits == 0 {
                        DagStatus::RollBackward
                    } else {
                        DagStatus::RollForward
                    };
                }
            }
        }
        for a in self.nodes[id].antecedents.clone() {
            self.nodes[a].num_succ_done += 1;
        }
        if self.header.status == DagStatus::RollBackward {
            return;
        }
        for s in self.nodes[id].succedents.clone() {
            let succ = &mut self.nodes[s];
            succ.num_ant_done += 1;
            if succ.num_ant_done == succ.antecedents.len() {
                ready.push_back(s);
            }
        }
    }

    /// Undo every completed node, most recently fired first.
    fn rollback(&mut self) {
        for id in self.fire_order.clone().into_iter().rev() {
            if self.nodes[id].status != NodeStatus::Good {
                continue;
            }
            self.nodes[id].status = NodeStatus::Recover;
            match self.undo_func(id) {
                Ok(()) => self.nodes[id].status = NodeStatus::Undone,
                Err(e) => {
                    tracing::error!(node = self.nodes[id].name, error = ?e,
                        "Could not undo DAG node");
                    self.nodes[id].status = NodeStatus::Panic;
                }
            }
        }
    }

    fn result(&self) -> Result<()> {
        let terminal_good = self.terminal
            .map(|t| self.nodes[t].status == NodeStatus::Good)
            .unwrap_or(false);
        if self.header.status == DagStatus::Enable && terminal_good {
            Ok(())
        } else {
            Err(self.nodes.iter()
                .find_map(|n| n.error)
                .unwrap_or(Error::EIO))
        }
    }
}

// LCOV_EXCL_STOP
