//! Ring topology store.
//!
//! Holds the forward and backward successor maps, the leader, and the set of
//! joiners waiting for admission. Only the leader mutates a topology it then
//! broadcasts; everyone else replaces theirs wholesale on receipt.

use super::types::{Direction, Pid};
use crate::error::{CoordinatorError, CoordinatorResult};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    pub leader: Pid,
    pub forward: BTreeMap<Pid, Pid>,
    pub backward: BTreeMap<Pid, Pid>,
    pub pending: BTreeSet<Pid>,
}

impl Topology {
    /// Builds a ring in ascending pid order, led by the lowest pid.
    pub fn build<I>(pids: I, pending: Option<BTreeSet<Pid>>) -> CoordinatorResult<Self>
    where
        I: IntoIterator<Item = Pid>,
    {
        let pids: BTreeSet<Pid> = pids.into_iter().collect();
        let leader = pids.first().cloned().ok_or(CoordinatorError::EmptyRing)?;
        Self::build_with_leader(pids, leader, pending)
    }

    /// Builds a ring in ascending pid order with an explicit leader.
    pub fn build_with_leader<I>(
        pids: I,
        leader: Pid,
        pending: Option<BTreeSet<Pid>>,
    ) -> CoordinatorResult<Self>
    where
        I: IntoIterator<Item = Pid>,
    {
        let pids: Vec<Pid> = pids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if pids.is_empty() {
            return Err(CoordinatorError::EmptyRing);
        }

        let mut forward = BTreeMap::new();
        for (i, pid) in pids.iter().enumerate() {
            let next = &pids[(i + 1) % pids.len()];
            forward.insert(pid.clone(), next.clone());
        }

        let backward = forward
            .iter()
            .map(|(first, second)| (second.clone(), first.clone()))
            .collect();

        let pending = pending
            .unwrap_or_default()
            .into_iter()
            .filter(|pid| !forward.contains_key(pid))
            .collect();

        let topology = Self {
            leader,
            forward,
            backward,
            pending,
        };
        topology.validate()?;

        Ok(topology)
    }

    /// Checks the structural invariants: identical key sets, `backward` is the
    /// exact inverse of `forward`, one cycle covering every member, and a
    /// leader that is a member.
    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.forward.is_empty() {
            return Err(CoordinatorError::EmptyRing);
        }

        if !self.forward.keys().eq(self.backward.keys()) {
            return Err(CoordinatorError::InvalidTopology(
                "forward and backward rings have different members".to_string(),
            ));
        }

        for (pid, next) in &self.forward {
            if self.backward.get(next) != Some(pid) {
                return Err(CoordinatorError::InvalidTopology(format!(
                    "backward({}) is not {}",
                    next, pid
                )));
            }
        }

        if !self.forward.contains_key(&self.leader) {
            return Err(CoordinatorError::InvalidTopology(format!(
                "leader {} is not a member",
                self.leader
            )));
        }

        let cycle_len = self
            .walk(&self.leader, Direction::Forward)
            .position(|pid| pid == &self.leader)
            .map(|i| i + 1);
        if cycle_len != Some(self.forward.len()) {
            return Err(CoordinatorError::InvalidTopology(
                "forward links do not form a single cycle".to_string(),
            ));
        }

        Ok(())
    }

    /// True iff both rings have the same leader, members and links.
    /// Pending joiners are not compared.
    pub fn same_ring(&self, other: &Topology) -> bool {
        self.leader == other.leader
            && self.forward == other.forward
            && self.backward == other.backward
    }

    pub fn neighbor_of(&self, pid: &Pid, direction: Direction) -> CoordinatorResult<&Pid> {
        self.links(direction)
            .get(pid)
            .ok_or_else(|| CoordinatorError::NoNeighbor(pid.clone()))
    }

    pub fn links(&self, direction: Direction) -> &BTreeMap<Pid, Pid> {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    pub fn contains(&self, pid: &Pid) -> bool {
        self.forward.contains_key(pid)
    }

    pub fn is_pending(&self, pid: &Pid) -> bool {
        self.pending.contains(pid)
    }

    pub fn members(&self) -> impl Iterator<Item = &Pid> {
        self.forward.keys()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Members in forward ring order, starting at the leader.
    pub fn players(&self) -> Vec<Pid> {
        let mut players = vec![self.leader.clone()];
        players.extend(
            self.walk(&self.leader, Direction::Forward)
                .take_while(|pid| *pid != &self.leader)
                .cloned(),
        );
        players
    }

    /// Successive pids after `from` in `direction`. Yields at most `len()`
    /// items, so a full lap ends with `from` itself.
    pub fn walk<'a>(
        &'a self,
        from: &'a Pid,
        direction: Direction,
    ) -> impl Iterator<Item = &'a Pid> + 'a {
        let links = self.links(direction);
        let mut current = from;

        (0..self.len()).map_while(move |_| {
            let next = links.get(current)?;
            current = next;
            Some(next)
        })
    }

    /// Splices `failed` out of the ring. Returns false if it was not a member,
    /// which makes repeated removal a no-op.
    pub fn remove(&mut self, failed: &Pid) -> bool {
        self.pending.remove(failed);

        let (Some(after), Some(before)) = (
            self.forward.get(failed).cloned(),
            self.backward.get(failed).cloned(),
        ) else {
            return false;
        };

        // Last member: nothing to stitch.
        if &after == failed {
            return false;
        }

        self.forward.insert(before.clone(), after.clone());
        self.backward.insert(after, before);
        self.forward.remove(failed);
        self.backward.remove(failed);

        true
    }

    /// Splices every pending pid into the ring immediately before `before`,
    /// in pid order, and clears `pending`. Returns the admitted pids.
    pub fn admit_pending(&mut self, before: &Pid) -> CoordinatorResult<Vec<Pid>> {
        let joiners: Vec<Pid> = std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|pid| !self.forward.contains_key(pid))
            .collect();

        if joiners.is_empty() {
            return Ok(joiners);
        }

        let mut last = self
            .backward
            .get(before)
            .cloned()
            .ok_or_else(|| CoordinatorError::NoNeighbor(before.clone()))?;

        for joiner in &joiners {
            self.forward.insert(last.clone(), joiner.clone());
            self.backward.insert(joiner.clone(), last);
            last = joiner.clone();
        }

        self.forward.insert(last.clone(), before.clone());
        self.backward.insert(before.clone(), last);

        Ok(joiners)
    }
}
