//! Typed, buffered event logging shared by the spool crates.
//!
//! A [`Registry`] binds stream names to typed [`Logger`] handles. Loggers
//! buffer events with the duration elapsed since a common instant, and hand
//! full buffers to a caller-installed action. The end of a stream is
//! indicated only by dropping the associated action, which `remove`
//! accomplishes.

#![forbid(missing_docs)]

use std::rc::Rc;
use std::cell::RefCell;
use std::any::Any;
use std::collections::HashMap;
use std::time::{Instant, Duration};

/// A map from stream names to typed loggers, sharing one epoch.
pub struct Registry {
    /// An instant common to all logging statements.
    time: Instant,
    /// A map from names to typed loggers.
    map: HashMap<String, (Box<dyn Any>, Box<dyn Flush>)>,
}

impl Registry {
    /// Binds a log name to an action on log event batches.
    ///
    /// This method also returns any pre-installed action, rather than
    /// overwriting it and pivoting the logging destination mid-stream. New
    /// loggers with this name will use the new destination, and existing
    /// loggers will use the old destination.
    ///
    /// The action sees batches of events with non-decreasing timestamps, as
    /// well as a timestamp that lower bounds the next event that could be
    /// seen.
    pub fn insert<T: 'static, F: Fn(&Duration, &[(Duration, T)])+'static>(
        &mut self,
        name: &str,
        action: F) -> Option<Box<dyn Any>>
    {
        let logger = Logger::<T>::new(self.time, Box::new(action));
        self.insert_logger(name, logger)
    }

    /// Binds a log name to a logger.
    pub fn insert_logger<T: 'static>(&mut self, name: &str, logger: Logger<T>) -> Option<Box<dyn Any>> {
        self.map.insert(name.to_owned(), (Box::new(logger.clone()), Box::new(logger))).map(|x| x.0)
    }

    /// Removes a bound logger.
    ///
    /// This is intended primarily to close a logging stream and let the
    /// associated writer communicate that the stream is closed to any
    /// consumers. If a binding is not removed, then the stream cannot be
    /// complete as in principle anyone could acquire a handle to the logger
    /// and start further logging.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name).map(|x| x.0)
    }

    /// Retrieves a shared logger, if one has been inserted.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .get(name)
            .and_then(|entry| entry.0.downcast_ref::<Logger<T>>())
            .cloned()
    }

    /// Flushes all registered logs.
    pub fn flush(&mut self) {
        for value in self.map.values() {
            value.1.flush();
        }
    }

    /// Creates a new logger registry.
    pub fn new(time: Instant) -> Self {
        Registry {
            time,
            map: HashMap::new(),
        }
    }
}

/// Types which can be flushed.
trait Flush {
    /// Flushes buffered data.
    fn flush(&self);
}

/// A buffering logger.
pub struct Logger<T> {
    time:   Instant,
    action: Rc<dyn Fn(&Duration, &[(Duration, T)])>,
    buffer: Rc<RefCell<Vec<(Duration, T)>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger {
            time: self.time,
            action: Rc::clone(&self.action),
            buffer: Rc::clone(&self.buffer),
        }
    }
}

impl<T> Logger<T> {
    /// Allocates a new shareable logger bound to a write destination.
    pub fn new(time: Instant, action: Box<dyn Fn(&Duration, &[(Duration, T)])>) -> Self {
        Logger {
            time,
            action: action.into(),
            buffer: Rc::new(RefCell::new(Vec::with_capacity(1024))),
        }
    }

    /// Logs an event.
    ///
    /// The event has its timestamp recorded at the moment of logging, but it
    /// may be delayed due to buffering. It will be written when the logger is
    /// next flushed, either due to the buffer reaching capacity or a direct
    /// call to flush.
    pub fn log(&self, event: impl Into<T>) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push((self.time.elapsed(), event.into()));
        if buffer.len() == buffer.capacity() {
            // Would call `self.flush()`, but for the `RefCell` borrow.
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Flushes logged messages and communicates the new minimal timestamp.
    pub fn flush(&self) {
        let mut buffer = self.buffer.borrow_mut();
        (self.action)(&self.time.elapsed(), &buffer[..]);
        buffer.clear();
    }
}

impl<T> Flush for Logger<T> {
    fn flush(&self) {
        self.flush()
    }
}

#[cfg(test)]
mod tests {

    use std::rc::Rc;
    use std::cell::RefCell;
    use std::time::Instant;

    use super::Registry;

    #[test]
    fn registry_round_trip() {
        let mut registry = Registry::new(Instant::now());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let previous = registry.insert::<u64, _>("events", move |_, batch| {
            sink.borrow_mut().extend(batch.iter().map(|(_, x)| *x));
        });
        assert!(previous.is_none());

        let logger = registry.get::<u64>("events").expect("logger bound");
        logger.log(3u64);
        logger.log(4u64);
        assert!(seen.borrow().is_empty());
        logger.flush();
        assert_eq!(&*seen.borrow(), &[3, 4]);

        assert!(registry.get::<u64>("absent").is_none());
        assert!(registry.remove("events").is_some());
        assert!(registry.get::<u64>("events").is_none());
    }
}
