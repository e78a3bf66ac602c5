// ABOUTME: Unbounded multi-producer multi-consumer job queue with advisory backpressure
// ABOUTME: Producers pause while a queue is above its high-water mark

use super::Job;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;

/// Producers give up waiting and enqueue anyway after this many pauses
const MAX_BACKPRESSURE_PAUSES: u32 = 12;

pub struct JobQueue {
    name: &'static str,
    jobs: Mutex<VecDeque<Job>>,
    available: Notify,
    high_water: usize,
    pause: Duration,
}

impl JobQueue {
    pub fn new(name: &'static str, high_water: usize, pause: Duration) -> Self {
        Self {
            name,
            jobs: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            high_water,
            pause,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue a job, pausing first while the queue is over its high-water mark
    pub async fn push(&self, job: Job) {
        let mut pauses = 0;
        while self.len() > self.high_water && pauses < MAX_BACKPRESSURE_PAUSES {
            tracing::warn!(
                "{} queue holds {} jobs (high-water mark {}), pausing for {:?}",
                self.name,
                self.len(),
                self.high_water,
                self.pause
            );
            tokio::time::sleep(self.pause).await;
            pauses += 1;
        }
        self.push_now(job);
    }

    /// Enqueue without backpressure
    pub fn push_now(&self, job: Job) {
        self.jobs.lock().push_back(job);
        self.available.notify_one();
    }

    /// Wait for the next job
    pub async fn pop(&self) -> Job {
        loop {
            // Registered before the check so a push in between still wakes us
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(job) = self.try_pop() {
                return job;
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
