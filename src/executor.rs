// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The single-consumer task queue that serializes all node state mutation.
//!
//! Jobs are boxed closures over the state value; one drain task owns the
//! state and runs jobs strictly in post order. Anything running off the
//! drain task (transport reader/writer tasks, timers, the public node
//! handle) interacts with state exclusively by posting jobs, which turns
//! every would-be race on the shared maps into plain single-writer code.
//!
//! Delayed posts are a spawned sleep followed by an ordinary post, so a
//! timer firing never bypasses the queue.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A unit of work executed against the queue's state on the drain task
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// The posting half of a single-consumer FIFO job queue
pub struct TaskQueue<S> {
    tx: mpsc::UnboundedSender<Job<S>>,
}

// manual impl: `S` itself need not be Clone for the sender to be
impl<S> Clone for TaskQueue<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// The receiving half of the queue, consumed by [JobReceiver::run]
pub struct JobReceiver<S> {
    rx: mpsc::UnboundedReceiver<Job<S>>,
}

impl<S> TaskQueue<S>
where
    S: Send + 'static,
{
    /// Create an unbounded queue, returning the posting handle and the
    /// receiver to hand to the drain task
    pub fn channel() -> (Self, JobReceiver<S>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobReceiver { rx })
    }

    /// Post a job onto the queue. Returns `false` if the drain task is gone.
    pub fn post<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Post a job after a delay. The job goes through the queue like any
    /// other, it is never applied from the timer task itself.
    pub fn post_after<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Box::new(job));
        });
    }
}

impl<S> JobReceiver<S>
where
    S: Send + 'static,
{
    /// Take ownership of the state and drain jobs until every posting
    /// handle is dropped
    pub fn run(mut self, mut state: S) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(job) = self.rx.recv().await {
                job(&mut state);
            }
        })
    }

    /// Receive the next job without running the drain loop. Lets tests step
    /// the queue by hand against a locally held state value.
    #[cfg(test)]
    pub(crate) async fn next(&mut self) -> Option<Job<S>> {
        self.rx.recv().await
    }

    /// Apply every job currently sitting in the queue to `state`, without
    /// waiting for more
    #[cfg(test)]
    pub(crate) fn drain_now(&mut self, state: &mut S) -> usize {
        let mut applied = 0;
        while let Ok(job) = self.rx.try_recv() {
            job(state);
            applied += 1;
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn jobs_run_in_post_order() {
        let (queue, jobs) = TaskQueue::<Vec<u32>>::channel();
        for i in 0..32u32 {
            queue.post(move |seen| seen.push(i));
        }

        let (tx, rx) = oneshot::channel();
        queue.post(move |seen| {
            let _ = tx.send(seen.clone());
        });

        let _drain = jobs.run(Vec::new());
        let seen = rx.await.expect("Drain task should report");
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn delayed_posts_go_through_the_queue() {
        let (queue, jobs) = TaskQueue::<u32>::channel();
        let (tx, rx) = oneshot::channel();

        queue.post_after(Duration::from_millis(20), |count| *count += 1);
        queue.post_after(Duration::from_millis(40), move |count| {
            *count += 1;
            let _ = tx.send(*count);
        });

        let _drain = jobs.run(0);
        assert_eq!(rx.await.expect("Drain task should report"), 2);
    }

    #[tokio::test]
    async fn manual_stepping_applies_jobs() {
        let (queue, mut jobs) = TaskQueue::<u32>::channel();
        queue.post(|count| *count += 1);
        queue.post(|count| *count += 10);

        let mut state = 0u32;
        let job = jobs.next().await.expect("Job should be queued");
        job(&mut state);
        assert_eq!(state, 1);
        assert_eq!(jobs.drain_now(&mut state), 1);
        assert_eq!(state, 11);
    }
}
