//! Push channels connecting the runner to downstream consumers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::rc::Rc;

/// Pushing elements of type `T`.
///
/// Pushing `None` conventionally signals a flush, and is the last thing a
/// sink observes before it is dropped.
pub trait Push<T> {
    /// Pushes `element` and provides the opportunity to take ownership.
    fn push(&mut self, element: &mut Option<T>);
    /// Pushes `element` and drops any resulting resources.
    #[inline]
    fn send(&mut self, element: T) {
        self.push(&mut Some(element));
    }
    /// Pushes `None`, conventionally signalling a flush.
    #[inline]
    fn done(&mut self) {
        self.push(&mut None);
    }
}

impl<T, P: ?Sized + Push<T>> Push<T> for Box<P> {
    #[inline]
    fn push(&mut self, element: &mut Option<T>) {
        (**self).push(element)
    }
}

type PushList<T> = Rc<RefCell<Vec<Box<dyn Push<T>>>>>;

/// Wraps a shared list of `Box<Push>` to forward pushes to.
///
/// This is the fan-out point behind each output tag: the worker registers
/// one pusher per downstream consumer, and each emitted value reaches all of
/// them.
pub struct Tee<T> {
    shared: PushList<T>,
}

impl<T: Clone> Push<T> for Tee<T> {
    fn push(&mut self, message: &mut Option<T>) {
        let mut pushers = self.shared.borrow_mut();
        if let Some(message) = message {
            for index in 1..pushers.len() {
                pushers[index - 1].send(message.clone());
            }
        } else {
            for index in 1..pushers.len() {
                pushers[index - 1].push(&mut None);
            }
        }
        if let Some(last) = pushers.last_mut() {
            last.push(message);
        }
    }
}

impl<T> Tee<T> {
    /// Allocates a new pair of `Tee` and `TeeHelper`.
    pub fn new() -> (Tee<T>, TeeHelper<T>) {
        let shared = Rc::new(RefCell::new(Vec::new()));
        let port = Tee { shared: Rc::clone(&shared) };
        (port, TeeHelper { shared })
    }
}

impl<T> Default for Tee<T> {
    fn default() -> Self {
        Tee::new().0
    }
}

impl<T> Clone for Tee<T> {
    fn clone(&self) -> Self {
        Tee { shared: Rc::clone(&self.shared) }
    }
}

impl<T> Debug for Tee<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Tee");
        if let Ok(shared) = self.shared.try_borrow() {
            debug.field("shared", &format!("{} pushers", shared.len()));
        } else {
            debug.field("shared", &"...");
        }
        debug.finish()
    }
}

/// A shared list of `Box<Push>` used to add `Push` implementors.
pub struct TeeHelper<T> {
    shared: PushList<T>,
}

impl<T> TeeHelper<T> {
    /// Adds a new `Push` implementor to the list of recipients.
    pub fn add_pusher<P: Push<T> + 'static>(&self, pusher: P) {
        self.shared.borrow_mut().push(Box::new(pusher));
    }
}

impl<T> Clone for TeeHelper<T> {
    fn clone(&self) -> Self {
        TeeHelper { shared: Rc::clone(&self.shared) }
    }
}

/// One `Tee` per output tag.
pub struct TagOutputs<T> {
    tees: HashMap<String, Tee<T>>,
    helpers: HashMap<String, TeeHelper<T>>,
}

impl<T> TagOutputs<T> {
    /// Allocates a tee per tag.
    pub fn new<S: AsRef<str>, I: IntoIterator<Item = S>>(tags: I) -> Self {
        let mut tees = HashMap::new();
        let mut helpers = HashMap::new();
        for tag in tags {
            let (tee, helper) = Tee::new();
            tees.insert(tag.as_ref().to_owned(), tee);
            helpers.insert(tag.as_ref().to_owned(), helper);
        }
        TagOutputs { tees, helpers }
    }

    /// The tee bound to `tag`, if the tag was declared.
    pub fn tee(&mut self, tag: &str) -> Option<&mut Tee<T>> {
        self.tees.get_mut(tag)
    }

    /// The registration handle for `tag`, if the tag was declared.
    pub fn helper(&self, tag: &str) -> Option<TeeHelper<T>> {
        self.helpers.get(tag).cloned()
    }
}

/// A pusher that drops everything pushed at it.
#[derive(Copy, Clone, Debug, Default)]
pub struct Discard;

impl<T> Push<T> for Discard {
    fn push(&mut self, element: &mut Option<T>) {
        element.take();
    }
}

/// A pusher that collects sent elements for later inspection.
///
/// Intended for wiring tests and capture-style consumers; flush signals are
/// ignored.
pub struct Collector<T> {
    items: Rc<RefCell<Vec<T>>>,
}

impl<T> Collector<T> {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Collector { items: Rc::new(RefCell::new(Vec::new())) }
    }

    /// The elements collected so far.
    pub fn take(&self) -> Vec<T> {
        self.items.borrow_mut().drain(..).collect()
    }

    /// The number of elements collected so far.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    /// True iff nothing has been collected.
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

impl<T> Default for Collector<T> {
    fn default() -> Self {
        Collector::new()
    }
}

impl<T> Clone for Collector<T> {
    fn clone(&self) -> Self {
        Collector { items: Rc::clone(&self.items) }
    }
}

impl<T> Push<T> for Collector<T> {
    fn push(&mut self, element: &mut Option<T>) {
        if let Some(element) = element.take() {
            self.items.borrow_mut().push(element);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_fans_out_to_every_pusher() {
        let (mut tee, helper) = Tee::<u32>::new();
        let first = Collector::new();
        let second = Collector::new();
        helper.add_pusher(first.clone());
        helper.add_pusher(second.clone());

        tee.send(5);
        tee.send(6);
        tee.done();

        assert_eq!(first.take(), vec![5, 6]);
        assert_eq!(second.take(), vec![5, 6]);
    }

    #[test]
    fn tag_outputs_reject_unknown_tags() {
        let mut outputs = TagOutputs::<u32>::new(["main"]);
        assert!(outputs.tee("main").is_some());
        assert!(outputs.tee("other").is_none());
        assert!(outputs.helper("other").is_none());
    }
}
