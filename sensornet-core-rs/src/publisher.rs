//! Topic-based synchronous publish/subscribe
//!
//! Subscribers to a specific title are called first, in subscription order,
//! followed by subscribers to every title. A panicking subscriber is logged
//! and skipped; the remaining subscribers still receive the issue.

use crate::panic::describe;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// A titled piece of content handed to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Issue<T> {
    pub title: String,
    pub content: T,
}

impl<T> Issue<T> {
    pub fn new(title: impl Into<String>, content: T) -> Self {
        Self {
            title: title.into(),
            content,
        }
    }
}

type Callback<T> = Arc<dyn Fn(&Issue<T>) + Send + Sync>;

struct Subscription<T> {
    name: String,
    callback: Callback<T>,
}

impl<T> Clone for Subscription<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            callback: self.callback.clone(),
        }
    }
}

struct Subscriptions<T> {
    by_title: HashMap<String, Vec<Subscription<T>>>,
    all: Vec<Subscription<T>>,
}

/// Publisher of issues of content type `T`
pub struct Publisher<T> {
    name: String,
    subs: Mutex<Subscriptions<T>>,
}

impl<T> Publisher<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subs: Mutex::new(Subscriptions {
                by_title: HashMap::new(),
                all: Vec::new(),
            }),
        }
    }

    /// Subscribe `callback` to issues with the given title
    pub fn subscribe<F>(&self, title: impl Into<String>, subscriber: impl Into<String>, callback: F)
    where
        F: Fn(&Issue<T>) + Send + Sync + 'static,
    {
        let sub = Subscription {
            name: subscriber.into(),
            callback: Arc::new(callback),
        };
        self.subs
            .lock()
            .by_title
            .entry(title.into())
            .or_default()
            .push(sub);
    }

    /// Subscribe `callback` to every issue regardless of title
    pub fn subscribe_all<F>(&self, subscriber: impl Into<String>, callback: F)
    where
        F: Fn(&Issue<T>) + Send + Sync + 'static,
    {
        let sub = Subscription {
            name: subscriber.into(),
            callback: Arc::new(callback),
        };
        self.subs.lock().all.push(sub);
    }

    /// Deliver an issue to all matching subscribers on the calling thread
    ///
    /// Returns how many subscribers handled it without panicking. The
    /// subscriber list is snapshotted first, so callbacks may subscribe.
    pub fn publish(&self, issue: Issue<T>) -> usize {
        let targets: Vec<Subscription<T>> = {
            let subs = self.subs.lock();
            subs.by_title
                .get(&issue.title)
                .into_iter()
                .flatten()
                .chain(subs.all.iter())
                .cloned()
                .collect()
        };

        let mut delivered = 0;
        for sub in targets {
            match catch_unwind(AssertUnwindSafe(|| (sub.callback)(&issue))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    error!(
                        "Publisher {}: subscriber {} failed on issue {}: {}",
                        self.name,
                        sub.name,
                        issue.title,
                        describe(payload.as_ref())
                    );
                }
            }
        }
        delivered
    }
}
