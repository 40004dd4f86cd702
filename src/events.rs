use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::decoders::DecodingState;
use crate::geometry::Rect;
use crate::image::ImageId;

type Observer<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Multi-subscriber broadcast: channel subscribers for consumers with their
/// own threads (the UI), synchronous observers for in-process wiring (the
/// model watching its images). Publishing never blocks on a channel;
/// observers run on the publisher's thread, so publishers must not hold an
/// image or model lock while publishing.
pub struct EventBus<T: Clone> {
    subscribers: Mutex<Vec<Sender<T>>>,
    observers: Mutex<Vec<Observer<T>>>,
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            observers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = unbounded();
        match self.subscribers.lock() {
            Ok(mut subs) => subs.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    pub fn observe(&self, observer: impl Fn(&T) + Send + Sync + 'static) {
        match self.observers.lock() {
            Ok(mut obs) => obs.push(Box::new(observer)),
            Err(poisoned) => poisoned.into_inner().push(Box::new(observer)),
        }
    }

    pub fn publish(&self, event: T) {
        {
            let obs = match self.observers.lock() {
                Ok(o) => o,
                Err(poisoned) => poisoned.into_inner(),
            };
            for observer in obs.iter() {
                observer(&event);
            }
        }
        let mut subs = match self.subscribers.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        match self.subscribers.lock() {
            Ok(s) => s.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

/// Events published per image, observed by the model and any viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageEvent {
    /// The decoder's state machine advanced (or reset).
    StateChanged {
        image: ImageId,
        new: DecodingState,
        old: DecodingState,
    },
    /// A (new or better) thumbnail became available.
    ThumbnailChanged { image: ImageId },
    /// Additional pixels of a still-incomplete preview were written. The
    /// rect is in full-resolution coordinates.
    DecodedRegionGrew { image: ImageId, rect: Rect },
    CheckStateChanged { image: ImageId },
}

/// Row-level roles a data change may touch; mirrors what a view needs to
/// re-query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowRole {
    Decoration,
    Tooltip,
    CheckState,
    Flags,
}

/// Events published by the sectioned model.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    AboutToInsertRows { first: usize, last: usize },
    RowsInserted { first: usize, last: usize },
    AboutToRemoveRows { first: usize, last: usize },
    RowsRemoved { first: usize, last: usize },
    AboutToReset,
    Reset,
    DataChanged {
        first: usize,
        last: usize,
        roles: Vec<RowRole>,
    },
    /// Coalesced "item geometry may have changed" notification.
    LayoutChanged,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(7);
        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus: EventBus<u32> = EventBus::new();
        let a = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), 1);
    }
}
