//! The per-bundle facade over the external state service.
//!
//! A [`StateAccessor`] lives from bundle start to bundle finish. It is keyed
//! by a closure that reads the runner's current element or timer: state is
//! only reachable while a keyed callback is active, and every read and write
//! targets the current window. Writes are buffered and flushed once at
//! finalization.

use std::fmt;
use std::rc::Rc;

use itertools::Itertools;

use crate::codec::encode_to_vec;
use crate::errors::Error;
use crate::window::Window;

/// A fully-qualified address of one user state cell.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct StateKey {
    /// The transform owning the state.
    pub transform_id: String,
    /// The state declaration's id.
    pub state_id: String,
    /// The encoded user key.
    pub key: Vec<u8>,
    /// The encoded window.
    pub window: Vec<u8>,
}

/// The external state service client.
///
/// Implementations are expected to talk to a remote service; the runner
/// only ever drives this from the process thread.
pub trait StateBackend {
    /// Reads all values in a state cell.
    fn read(&mut self, key: &StateKey) -> Result<Vec<Vec<u8>>, Error>;
    /// Appends values to a state cell.
    fn append(&mut self, key: &StateKey, values: Vec<Vec<u8>>) -> Result<(), Error>;
    /// Clears a state cell.
    fn clear(&mut self, key: &StateKey) -> Result<(), Error>;
    /// Reads the values under `key` in a multimap side input view.
    fn multimap_side_input(
        &mut self,
        transform_id: &str,
        tag: &str,
        window: &[u8],
        key: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error>;
}

/// The closure yielding the current key and window, if a keyed callback is
/// active.
pub type CurrentKeyFn = Rc<dyn Fn() -> Option<(Vec<u8>, Window)>>;

/// The backend for transforms that use no state and no side inputs: reads
/// see empty cells and writes vanish.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoState;

impl StateBackend for NoState {
    fn read(&mut self, _key: &StateKey) -> Result<Vec<Vec<u8>>, Error> {
        Ok(Vec::new())
    }
    fn append(&mut self, _key: &StateKey, _values: Vec<Vec<u8>>) -> Result<(), Error> {
        Ok(())
    }
    fn clear(&mut self, _key: &StateKey) -> Result<(), Error> {
        Ok(())
    }
    fn multimap_side_input(
        &mut self,
        _transform_id: &str,
        _tag: &str,
        _window: &[u8],
        _key: &[u8],
    ) -> Result<Vec<Vec<u8>>, Error> {
        Ok(Vec::new())
    }
}

/// A side-input materialization recipe.
///
/// Multimap is the only materialization; what varies per side input is how
/// the main-input window maps onto the view's window.
#[derive(Clone)]
pub struct SideInputSpec {
    window_mapping: Rc<dyn Fn(&Window) -> Window>,
}

impl fmt::Debug for SideInputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SideInputSpec").finish_non_exhaustive()
    }
}

impl SideInputSpec {
    /// A multimap side input whose windows coincide with the main input's.
    pub fn multimap() -> Self {
        SideInputSpec { window_mapping: Rc::new(|window| *window) }
    }

    /// Replaces the window-mapping function.
    pub fn set_window_mapping<F: Fn(&Window) -> Window + 'static>(&mut self, mapping: F) {
        self.window_mapping = Rc::new(mapping);
    }

    /// Maps a main-input window onto the view's window.
    pub fn map_window(&self, window: &Window) -> Window {
        (self.window_mapping)(window)
    }
}

#[derive(Clone, Debug)]
enum PendingWrite {
    Append(Vec<u8>),
    Clear,
}

/// The per-bundle state facade.
pub struct StateAccessor {
    transform_id: String,
    backend: Box<dyn StateBackend>,
    current: CurrentKeyFn,
    pending: Vec<(StateKey, PendingWrite)>,
}

impl StateAccessor {
    /// Creates the accessor for one bundle.
    pub fn new(transform_id: &str, backend: Box<dyn StateBackend>, current: CurrentKeyFn) -> Self {
        StateAccessor {
            transform_id: transform_id.to_owned(),
            backend,
            current,
            pending: Vec::new(),
        }
    }

    fn current_key(&self, state_id: &str) -> Result<StateKey, Error> {
        let (key, window) = (self.current)().ok_or_else(|| {
            Error::Usage(
                "state access requires a keyed current element or a firing timer".to_owned(),
            )
        })?;
        Ok(StateKey {
            transform_id: self.transform_id.clone(),
            state_id: state_id.to_owned(),
            key,
            window: encode_to_vec(&window)?,
        })
    }

    /// Binds a bag-state handle for `state_id` at the current key and window.
    pub fn bag(&mut self, state_id: &str) -> Result<BagHandle<'_>, Error> {
        let key = self.current_key(state_id)?;
        Ok(BagHandle { accessor: self, key })
    }

    /// Reads the multimap side input `tag` under `key` in the view window
    /// mapped from `window`.
    pub fn side_input(
        &mut self,
        spec: &SideInputSpec,
        tag: &str,
        key: &[u8],
        window: &Window,
    ) -> Result<Vec<Vec<u8>>, Error> {
        let mapped = spec.map_window(window);
        let window_bytes = encode_to_vec(&mapped)?;
        self.backend.multimap_side_input(&self.transform_id, tag, &window_bytes, key)
    }

    /// Flushes all buffered writes, grouped per state cell.
    ///
    /// Within a cell, a clear discards everything buffered before it, so the
    /// flush issues at most one clear followed by one batched append.
    pub fn finalize(&mut self) -> Result<(), Error> {
        let pending = std::mem::take(&mut self.pending);
        for (key, writes) in pending.into_iter().into_group_map() {
            let clear_at = writes
                .iter()
                .rposition(|write| matches!(write, PendingWrite::Clear));
            if clear_at.is_some() {
                self.backend.clear(&key)?;
            }
            let appends: Vec<Vec<u8>> = writes
                .into_iter()
                .skip(clear_at.map_or(0, |at| at + 1))
                .map(|write| match write {
                    PendingWrite::Append(value) => value,
                    PendingWrite::Clear => unreachable!("clears precede the append suffix"),
                })
                .collect();
            if !appends.is_empty() {
                self.backend.append(&key, appends)?;
            }
        }
        Ok(())
    }
}

/// A handle onto one bag-state cell.
pub struct BagHandle<'a> {
    accessor: &'a mut StateAccessor,
    key: StateKey,
}

impl BagHandle<'_> {
    /// Reads the cell: the backend's contents plus anything buffered in this
    /// bundle, with buffered clears honored.
    pub fn read(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        let mut values = self.accessor.backend.read(&self.key)?;
        for (key, write) in &self.accessor.pending {
            if *key != self.key {
                continue;
            }
            match write {
                PendingWrite::Append(value) => values.push(value.clone()),
                PendingWrite::Clear => values.clear(),
            }
        }
        Ok(values)
    }

    /// Buffers an append to the cell.
    pub fn append(&mut self, value: Vec<u8>) {
        self.accessor
            .pending
            .push((self.key.clone(), PendingWrite::Append(value)));
    }

    /// Buffers a clear of the cell.
    pub fn clear(&mut self) {
        self.accessor.pending.push((self.key.clone(), PendingWrite::Clear));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    use super::*;
    use crate::time::Instant;

    #[derive(Default)]
    struct MemoryBackend {
        cells: Rc<RefCell<HashMap<StateKey, Vec<Vec<u8>>>>>,
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl StateBackend for MemoryBackend {
        fn read(&mut self, key: &StateKey) -> Result<Vec<Vec<u8>>, Error> {
            Ok(self.cells.borrow().get(key).cloned().unwrap_or_default())
        }
        fn append(&mut self, key: &StateKey, values: Vec<Vec<u8>>) -> Result<(), Error> {
            self.calls.borrow_mut().push(format!("append:{}", values.len()));
            self.cells.borrow_mut().entry(key.clone()).or_default().extend(values);
            Ok(())
        }
        fn clear(&mut self, key: &StateKey) -> Result<(), Error> {
            self.calls.borrow_mut().push("clear".to_owned());
            self.cells.borrow_mut().remove(key);
            Ok(())
        }
        fn multimap_side_input(
            &mut self,
            _transform_id: &str,
            tag: &str,
            _window: &[u8],
            key: &[u8],
        ) -> Result<Vec<Vec<u8>>, Error> {
            Ok(vec![[tag.as_bytes(), b":", key].concat()])
        }
    }

    fn keyed_accessor(backend: MemoryBackend) -> StateAccessor {
        StateAccessor::new(
            "t1",
            Box::new(backend),
            Rc::new(|| Some((vec![1], Window::Global))),
        )
    }

    #[test]
    fn keyless_access_is_a_usage_error() {
        let mut accessor = StateAccessor::new("t1", Box::new(MemoryBackend::default()), Rc::new(|| None));
        assert!(matches!(accessor.bag("counts"), Err(Error::Usage(_))));
    }

    #[test]
    fn reads_see_buffered_writes() {
        let mut accessor = keyed_accessor(MemoryBackend::default());
        let mut bag = accessor.bag("counts").unwrap();
        bag.append(vec![1]);
        bag.append(vec![2]);
        assert_eq!(bag.read().unwrap(), vec![vec![1], vec![2]]);
        bag.clear();
        bag.append(vec![3]);
        assert_eq!(bag.read().unwrap(), vec![vec![3]]);
    }

    #[test]
    fn finalize_flushes_one_clear_then_one_append() {
        let backend = MemoryBackend::default();
        let calls = Rc::clone(&backend.calls);
        let cells = Rc::clone(&backend.cells);
        let mut accessor = keyed_accessor(backend);

        let mut bag = accessor.bag("counts").unwrap();
        bag.append(vec![1]);
        bag.clear();
        bag.append(vec![2]);
        bag.append(vec![3]);
        accessor.finalize().unwrap();

        assert_eq!(&*calls.borrow(), &["clear".to_owned(), "append:2".to_owned()]);
        let stored: Vec<_> = cells.borrow().values().cloned().collect();
        assert_eq!(stored, vec![vec![vec![2], vec![3]]]);
    }

    #[test]
    fn side_inputs_query_the_mapped_window() {
        let mut accessor = keyed_accessor(MemoryBackend::default());
        let spec = SideInputSpec::multimap();
        let window = Window::interval(Instant::from_millis(0), Instant::from_millis(10));
        let values = accessor.side_input(&spec, "lookup", b"k", &window).unwrap();
        assert_eq!(values, vec![b"lookup:k".to_vec()]);
    }
}
