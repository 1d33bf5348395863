// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::{cmp::Ordering, collections::BinaryHeap};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::BuildTask;
use crate::error::{Error, Result};

/// Bounded priority queue of build tasks.
///
/// Lower priority values are dequeued first; equal priorities dequeue in submission order.
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    task: BuildTask,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Entry {}

impl TaskQueue {
    /// A queue holding at most `capacity` tasks.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::default(),
            available: Notify::new(),
            capacity,
        }
    }

    /// Enqueue `task`, failing if the queue is full or closed.
    pub fn push(&self, task: BuildTask) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PipelineClosed);
        }
        if state.heap.len() >= self.capacity {
            return Err(Error::QueueFull(self.capacity));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        log::trace!("queued {} (priority {})", task.task_id, task.priority);
        state.heap.push(Entry { seq, task });
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Wait for the next task. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<BuildTask> {
        loop {
            let notified = self.available.notified();
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(entry) = state.heap.pop() {
                    return Some(entry.task);
                }
            }
            notified.await;
        }
    }

    /// Close the queue, returning the tasks that were never dequeued.
    pub fn close(&self) -> Vec<BuildTask> {
        let mut state = self.state.lock();
        state.closed = true;
        let pending = std::mem::take(&mut state.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|e| e.task)
            .collect();
        drop(state);

        self.available.notify_waiters();
        pending
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Whether no task is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::TaskQueue;
    use crate::{build::BuildTask, error::Error};

    fn task(name: &str, priority: u32) -> BuildTask {
        BuildTask::new(name, format!("SELECT 1 AS {name}"), format!("{name}.parquet"), vec![], priority)
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_submission() {
        let queue = TaskQueue::new(8);
        queue.push(task("low_a", 5)).unwrap();
        queue.push(task("high", 1)).unwrap();
        queue.push(task("low_b", 5)).unwrap();

        let mut order = vec![];
        for _ in 0..3 {
            order.push(queue.pop().await.unwrap().mv_name);
        }
        assert_eq!(order, vec!["high", "low_a", "low_b"]);
    }

    #[test]
    fn rejects_when_full_or_closed() {
        let queue = TaskQueue::new(1);
        queue.push(task("a", 1)).unwrap();
        assert!(matches!(queue.push(task("b", 1)), Err(Error::QueueFull(1))));

        let pending = queue.close();
        assert_eq!(pending.len(), 1);
        assert!(queue.is_empty());
        assert!(matches!(queue.push(task("c", 1)), Err(Error::PipelineClosed)));
    }

    #[tokio::test]
    async fn close_wakes_waiting_consumers() {
        let queue = Arc::new(TaskQueue::new(4));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();
        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }
}
