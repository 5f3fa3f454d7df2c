//! Transactions: ordered, atomically committed batches of jobs.
//!
//! Any thread may open a transaction, append jobs and commit it through
//! the engine. The master consumes committed transactions strictly in
//! commit order (one FIFO queue), and all jobs of one transaction execute
//! contiguously, never interleaved with another transaction's jobs.
//!
//! A transaction is consumed by commit, so double commits are
//! unrepresentable; dismissal is simply dropping it (payload teardown
//! then happens on the dismissing thread, which is by definition a user
//! thread).

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::job::Job;

/// An ordered batch of jobs, committed atomically.
pub struct Transaction {
    pub(crate) jobs: Vec<Job>,
}

impl Transaction {
    /// Open a new empty transaction.
    pub fn open() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Append a job; jobs execute in append order.
    pub fn add(&mut self, job: Job) {
        self.jobs.push(job);
    }

    /// Concatenate `other`'s jobs onto this transaction, consuming it.
    pub fn merge(&mut self, other: Transaction) {
        self.jobs.extend(other.jobs);
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::open()
    }
}

/// The engine's commit queue: MPSC from committing threads to the
/// master, plus the bookkeeping for `wait_on_trans` and the commit base
/// stamp.
pub(crate) struct CommitQueue {
    tx: Sender<Transaction>,
    rx: Receiver<Transaction>,
    /// Transactions committed but not yet fully executed.
    pending: Mutex<usize>,
    drained: Condvar,
    /// Tick stamp of the last moment the queue was observed empty by the
    /// master; commits take effect no later than one block after it.
    base_stamp: AtomicU64,
}

impl CommitQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            pending: Mutex::new(0),
            drained: Condvar::new(),
            base_stamp: AtomicU64::new(0),
        }
    }

    /// Enqueue a committed transaction; returns the tick stamp by which
    /// its execution is guaranteed to have started.
    pub fn push(&self, trans: Transaction, block_size: u64) -> u64 {
        debug_assert!(!trans.jobs.is_empty());
        {
            let mut pending = self.pending.lock();
            *pending += 1;
        }
        // The queue is unbounded; send only fails when the engine is
        // gone, in which case the jobs are simply dropped on this thread.
        let _ = self.tx.send(trans);
        self.base_stamp.load(Ordering::Acquire) + block_size
    }

    /// Master side: fetch the next committed transaction, if any.
    pub fn try_pop(&self) -> Option<Transaction> {
        self.rx.try_recv().ok()
    }

    /// Master side: a popped transaction has been fully executed.
    pub fn mark_done(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    /// Master side: record the stamp at which the queue drained.
    pub fn set_base_stamp(&self, stamp: u64) {
        self.base_stamp.store(stamp, Ordering::Release);
    }

    /// Whether committed transactions are waiting or in flight.
    pub fn job_pending(&self) -> bool {
        *self.pending.lock() > 0
    }

    /// Block until all committed transactions have executed.
    pub fn wait_drained(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.drained.wait(&mut pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Module, ModuleClass, ProcessContext, Processor};

    struct Null;
    impl Processor for Null {
        fn process(&mut self, _ctx: &mut ProcessContext<'_>) {}
    }

    #[test]
    fn test_open_add_merge() {
        let m = Module::new(ModuleClass::new(0, 0, 1), Box::new(Null)).unwrap();
        let mut t1 = Transaction::open();
        assert!(t1.is_empty());
        t1.add(Job::integrate(&m));
        let mut t2 = Transaction::open();
        t2.add(Job::set_consumer(&m));
        t1.merge(t2);
        assert_eq!(t1.len(), 2);
    }

    #[test]
    fn test_queue_fifo_and_drain() {
        let q = CommitQueue::new();
        let m = Module::new(ModuleClass::new(0, 0, 1), Box::new(Null)).unwrap();

        let mut t1 = Transaction::open();
        t1.add(Job::integrate(&m));
        let mut t2 = Transaction::open();
        t2.add(Job::discard(&m));
        q.push(t1, 64);
        q.push(t2, 64);
        assert!(q.job_pending());

        let first = q.try_pop().unwrap();
        assert!(matches!(
            first.jobs[0].kind,
            crate::job::JobKind::Integrate(_)
        ));
        q.mark_done();
        let second = q.try_pop().unwrap();
        assert!(matches!(second.jobs[0].kind, crate::job::JobKind::Discard(_)));
        q.mark_done();
        assert!(!q.job_pending());
        q.wait_drained();
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_commit_stamp_uses_base() {
        let q = CommitQueue::new();
        q.set_base_stamp(1024);
        let mut t = Transaction::open();
        let m = Module::new(ModuleClass::new(0, 0, 1), Box::new(Null)).unwrap();
        t.add(Job::integrate(&m));
        assert_eq!(q.push(t, 256), 1280);
        q.try_pop();
        q.mark_done();
    }
}
