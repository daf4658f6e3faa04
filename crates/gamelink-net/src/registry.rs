//! Table of pending transactions.
//!
//! Entries live in generational slots addressed by [`TransId`] and are
//! tracked in submission order. The registry itself is single-threaded;
//! the network context guards it with a mutex and runs completion hooks
//! only after that mutex is released, using the [`Finished`] values handed
//! back here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::conn::{Conn, ConnId};
use crate::error::{NetError, TransResult};
use crate::protocol::Protocol;
use crate::trans::{RecvOutcome, SendContext, TransId, TransState, Transaction};

struct Entry {
    id: TransId,
    trans: Box<dyn Transaction>,
    protocol: Protocol,
    state: TransState,
    result: TransResult,
    conn: Option<Arc<Conn>>,
    timeout: Duration,
    deadline: Instant,
    tick: u64,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// A transaction removed from the registry, ready for its completion hook.
pub struct Finished {
    id: TransId,
    trans: Box<dyn Transaction>,
    result: TransResult,
    conn: Option<Arc<Conn>>,
}

impl Finished {
    pub fn id(&self) -> TransId {
        self.id
    }

    pub fn result(&self) -> &TransResult {
        &self.result
    }

    /// Drop the reference to the connection the transaction was bound to.
    pub fn release_conn(&mut self) {
        self.conn = None;
    }

    /// Release the connection reference, then run the completion hook.
    pub fn post(mut self) {
        self.release_conn();
        let Finished {
            id, trans, result, ..
        } = self;
        tracing::trace!("{id} {} posting {result:?}", trans.kind());
        trans.post(result);
    }

    /// Post a batch in order. Every connection reference in the batch is
    /// released before the first hook runs.
    pub fn post_all(mut batch: Vec<Finished>) {
        batch.iter_mut().for_each(Finished::release_conn);
        batch.into_iter().for_each(Finished::post);
    }
}

/// How an inbound reply was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvDisposition {
    /// No matching transaction waiting on that connection; dropped.
    Unmatched,
    /// Accepted, more expected.
    Pending,
    /// The transaction finished; `true` if it succeeded.
    Completed(bool),
    /// The transaction rejected the message as malformed.
    Malformed,
}

pub struct TransRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    order: Vec<TransId>,
    tick: u64,
}

impl Default for TransRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TransRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            order: Vec::new(),
            tick: 0,
        }
    }

    /// Register a transaction in `WaitServerConnect`.
    pub fn insert(
        &mut self,
        trans: Box<dyn Transaction>,
        timeout: Duration,
        now: Instant,
    ) -> Result<TransId, NetError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < TransId::MAX_SLOTS => {
                self.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                self.slots.len() - 1
            }
            None => return Err(NetError::Overloaded),
        };
        let slot = &mut self.slots[index];
        let id = TransId::new(index, slot.generation);
        let protocol = trans.protocol();
        tracing::debug!("{id} {} submitted on {protocol}", trans.kind());
        slot.entry = Some(Entry {
            id,
            trans,
            protocol,
            state: TransState::WaitServerConnect,
            result: Ok(()),
            conn: None,
            timeout,
            deadline: now + timeout,
            tick: self.tick,
        });
        self.order.push(id);
        Ok(id)
    }

    pub fn state(&self, id: TransId) -> Option<TransState> {
        self.entry(id).map(|entry| entry.state)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn count_for(&self, protocol: Protocol) -> usize {
        self.order
            .iter()
            .filter_map(|id| self.entry(*id))
            .filter(|entry| entry.protocol == protocol)
            .count()
    }

    /// Current update tick. Transactions inserted now carry this value.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn advance_tick(&mut self) {
        self.tick += 1;
    }

    /// Offer `conn` to one waiting transaction.
    pub fn start(&mut self, id: TransId, conn: &Arc<Conn>, now: Instant) -> bool {
        match self.entry_mut(id) {
            Some(entry) if entry.protocol == conn.protocol() => start_entry(entry, conn, now),
            _ => false,
        }
    }

    /// Offer `conn` to every waiting transaction of its protocol, in
    /// submission order. Returns how many were sent.
    pub fn start_waiting(&mut self, conn: &Arc<Conn>, now: Instant) -> usize {
        let protocol = conn.protocol();
        let mut started = 0;
        for i in 0..self.order.len() {
            let id = self.order[i];
            if let Some(entry) = self.entry_mut(id)
                && entry.protocol == protocol
                && start_entry(entry, conn, now)
            {
                started += 1;
            }
        }
        started
    }

    /// Route a reply to the transaction waiting on `conn` under `id`.
    pub fn recv(&mut self, conn: ConnId, id: TransId, msg_id: u16, body: &[u8]) -> RecvDisposition {
        let Some(entry) = self.entry_mut(id) else {
            return RecvDisposition::Unmatched;
        };
        let bound = entry.conn.as_ref().is_some_and(|c| c.id() == conn);
        if entry.state != TransState::WaitServerResponse || !bound {
            return RecvDisposition::Unmatched;
        }

        match entry.trans.recv(msg_id, body) {
            RecvOutcome::Pending => RecvDisposition::Pending,
            RecvOutcome::Complete(result) => {
                let ok = result.is_ok();
                entry.state = TransState::Complete;
                entry.result = result;
                RecvDisposition::Completed(ok)
            }
            RecvOutcome::Malformed => {
                tracing::warn!("{id} {} rejected message {msg_id}", entry.trans.kind());
                entry.state = TransState::Complete;
                entry.result = Err(NetError::ProtocolViolation);
                RecvDisposition::Malformed
            }
        }
    }

    /// Complete every transaction whose deadline has passed and that
    /// accepts the timeout. The rest get a fresh deadline.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        for i in 0..self.order.len() {
            let id = self.order[i];
            let Some(entry) = self.entry_mut(id) else {
                continue;
            };
            if entry.state == TransState::Complete || now < entry.deadline {
                continue;
            }
            if entry.trans.timed_out() {
                tracing::warn!("{id} {} timed out on {}", entry.trans.kind(), entry.protocol);
                entry.state = TransState::Complete;
                entry.result = Err(NetError::Timeout);
                expired += 1;
            } else {
                entry.deadline = now + entry.timeout;
            }
        }
        expired
    }

    /// Remove completed transactions that may post now.
    ///
    /// Ordinary transactions come first in submission order, then deferred
    /// ones in submission order. A deferred transaction is held while any
    /// ordinary transaction from its submission tick is still pending.
    pub fn take_completed(&mut self) -> Vec<Finished> {
        let blocking_ticks: HashSet<u64> = self
            .order
            .iter()
            .filter_map(|id| self.entry(*id))
            .filter(|entry| entry.state != TransState::Complete && !entry.trans.has_sub_trans())
            .map(|entry| entry.tick)
            .collect();

        let mut ordinary = Vec::new();
        let mut deferred = Vec::new();
        for id in &self.order {
            let Some(entry) = self.entry(*id) else {
                continue;
            };
            if entry.state != TransState::Complete {
                continue;
            }
            if !entry.trans.has_sub_trans() {
                ordinary.push(*id);
            } else if !blocking_ticks.contains(&entry.tick) {
                deferred.push(*id);
            }
        }

        ordinary.extend(deferred);
        self.remove_all(&ordinary)
    }

    /// Remove one transaction, completing it with `error` unless it had
    /// already finished.
    pub fn cancel(&mut self, id: TransId, error: NetError) -> Option<Finished> {
        self.entry(id)?;
        self.cancel_matching(|entry| entry.id == id, error).pop()
    }

    pub fn cancel_by_protocol(&mut self, protocol: Protocol, error: NetError) -> Vec<Finished> {
        self.cancel_matching(|entry| entry.protocol == protocol, error)
    }

    pub fn cancel_by_conn(&mut self, conn: ConnId, error: NetError) -> Vec<Finished> {
        self.cancel_matching(
            |entry| entry.conn.as_ref().is_some_and(|c| c.id() == conn),
            error,
        )
    }

    pub fn cancel_all(&mut self, error: NetError) -> Vec<Finished> {
        self.cancel_matching(|_| true, error)
    }

    fn cancel_matching(&mut self, matches: impl Fn(&Entry) -> bool, error: NetError) -> Vec<Finished> {
        let mut ordinary = Vec::new();
        let mut deferred = Vec::new();
        for i in 0..self.order.len() {
            let id = self.order[i];
            let Some(entry) = self.entry_mut(id) else {
                continue;
            };
            if !matches(entry) {
                continue;
            }
            if entry.state != TransState::Complete {
                entry.state = TransState::Complete;
                entry.result = Err(error.clone());
            }
            if entry.trans.has_sub_trans() {
                deferred.push(id);
            } else {
                ordinary.push(id);
            }
        }
        if !ordinary.is_empty() || !deferred.is_empty() {
            tracing::debug!(
                "cancelling {} transaction(s): {error}",
                ordinary.len() + deferred.len()
            );
        }
        ordinary.extend(deferred);
        self.remove_all(&ordinary)
    }

    fn remove_all(&mut self, ids: &[TransId]) -> Vec<Finished> {
        if ids.is_empty() {
            return Vec::new();
        }
        let removed: HashSet<TransId> = ids.iter().copied().collect();
        self.order.retain(|id| !removed.contains(id));
        ids.iter().filter_map(|id| self.remove(*id)).collect()
    }

    fn remove(&mut self, id: TransId) -> Option<Finished> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = if slot.generation >= TransId::MAX_GENERATION {
            1
        } else {
            slot.generation + 1
        };
        self.free.push(id.index());
        Some(Finished {
            id: entry.id,
            trans: entry.trans,
            result: entry.result,
            conn: entry.conn,
        })
    }

    fn entry(&self, id: TransId) -> Option<&Entry> {
        let slot = self.slots.get(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, id: TransId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.entry.as_mut()
    }
}

fn start_entry(entry: &mut Entry, conn: &Arc<Conn>, now: Instant) -> bool {
    if entry.state != TransState::WaitServerConnect || !entry.trans.can_start() {
        return false;
    }
    let ctx = SendContext::new(entry.id, conn);
    if !entry.trans.send(&ctx) {
        return false;
    }
    tracing::debug!("{} {} sent on {}", entry.id, entry.trans.kind(), conn.id());
    entry.conn = Some(Arc::clone(conn));
    entry.state = TransState::WaitServerResponse;
    entry.deadline = now + entry.timeout;
    true
}
