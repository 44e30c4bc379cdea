/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! Ordered delivery of change notifications to an external observer.
//!
//! Components decide on a change while holding their state lock, stamp it
//! with a generation, and deliver it after releasing that lock. Changes
//! that reach the notifier ahead of an earlier generation wait in a queue
//! until the gap is filled, so the observer sees every change exactly once
//! and in the order the component made them.
//!
//! Observers may read from the component that notifies them but must not
//! feed it new samples from inside the notification.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::lock;

struct Queue<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

pub(crate) struct Notifier<T, O: ?Sized> {
    observer: Option<Box<O>>,
    queue: Mutex<Queue<T>>,
}

impl<T, O: ?Sized> Notifier<T, O> {
    /// Generations handed to [`deliver`](Self::deliver) start at 1 and
    /// increase by one per change.
    pub(crate) fn new(observer: Option<Box<O>>) -> Self {
        Self {
            observer,
            queue: Mutex::new(Queue {
                next: 1,
                pending: BTreeMap::new(),
            }),
        }
    }

    /// Queue the change stamped `generation`, then hand every change that is
    /// now in sequence to the observer. Returns how many this call delivered.
    pub(crate) fn deliver(&self, generation: u64, value: T, notify: impl Fn(&O, T)) -> usize {
        let mut guard = lock(&self.queue);
        let queue = &mut *guard;
        if generation < queue.next {
            log::warn!("[NOTIFY] Ignoring replayed generation {generation}");
            return 0;
        }
        queue.pending.insert(generation, value);

        let mut delivered = 0;
        while let Some(value) = queue.pending.remove(&queue.next) {
            queue.next += 1;
            delivered += 1;
            if let Some(observer) = self.observer.as_deref() {
                notify(observer, value);
            }
        }
        delivered
    }
}
