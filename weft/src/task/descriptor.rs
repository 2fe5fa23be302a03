use std::any::Any;
use std::cell::{Cell, RefCell, RefMut};
use std::fmt;

/// Sublocale identifier. A process is a single locale here, so the only
/// addressable values are `0` and [`SUBLOC_ANY`].
pub type SubLoc = i32;

/// "Run anywhere" placement.
pub const SUBLOC_ANY: SubLoc = -1;

/// Entry point of a task. It receives the descriptor the task was created
/// with, which lives in the task's private storage for as long as it runs.
pub type TaskFn = fn(&TaskDescriptor);

/// Index into a [`FnTable`].
pub type FnId = usize;

pub(crate) fn is_local_subloc(subloc: SubLoc) -> bool {
    subloc == 0 || subloc == SUBLOC_ANY
}

/// Table of entry points addressed by integer id, handed to the runtime at
/// init so callers can spawn by id without the runtime knowing what the
/// functions do.
#[derive(Debug, Clone, Default)]
pub struct FnTable {
    fns: Vec<TaskFn>,
}

impl FnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `f` and returns its id. Ids are dense and start at 0.
    pub fn register(&mut self, f: TaskFn) -> FnId {
        self.fns.push(f);
        self.fns.len() - 1
    }

    pub fn get(&self, id: FnId) -> Option<TaskFn> {
        self.fns.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }
}

impl FromIterator<TaskFn> for FnTable {
    fn from_iter<I: IntoIterator<Item = TaskFn>>(iter: I) -> Self {
        Self {
            fns: iter.into_iter().collect(),
        }
    }
}

/// Opaque per-task slot for caller defined state. It is reset every time a
/// descriptor is handed to a new task.
#[derive(Default)]
pub struct PrivateData {
    slot: Option<Box<dyn Any + Send>>,
}

impl PrivateData {
    pub fn insert<T: Any + Send>(&mut self, value: T) {
        self.slot = Some(Box::new(value));
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.slot.as_deref().and_then(|slot| slot.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.slot.as_deref_mut().and_then(|slot| slot.downcast_mut())
    }

    /// Returns the stored `T`, replacing whatever the slot held if it is not
    /// a `T`.
    pub fn get_or_insert_with<T: Any + Send>(&mut self, f: impl FnOnce() -> T) -> &mut T {
        let keep = self.slot.as_deref().is_some_and(|slot| slot.is::<T>());
        if !keep {
            self.slot = Some(Box::new(f()));
        }

        self.slot
            .as_deref_mut()
            .and_then(|slot| slot.downcast_mut())
            .expect("private data slot was just filled with T")
    }

    pub fn take<T: Any>(&mut self) -> Option<T> {
        match self.slot.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.slot = Some(other);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

impl fmt::Debug for PrivateData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateData")
            .field("occupied", &self.slot.is_some())
            .finish()
    }
}

/// Scheduling metadata of a task, carried from creation to completion.
///
/// The caller builds one, hands it to a spawn call by value, and the runtime
/// moves it into the new task's private storage. Inside the task it is reached
/// through [`crate::task::with_current_descriptor`]; the two fields a running
/// task may change (serial state and requested sublocale) use interior
/// mutability so the entry function's `&TaskDescriptor` stays valid.
pub struct TaskDescriptor {
    serial_state: Cell<bool>,
    count_running: bool,
    is_cross_locality: bool,
    requested_subloc: Cell<SubLoc>,
    entry_fn: Option<TaskFn>,
    args: Option<Box<dyn Any + Send>>,
    prv: RefCell<PrivateData>,
}

impl TaskDescriptor {
    pub fn new() -> Self {
        Self {
            serial_state: Cell::new(false),
            count_running: false,
            is_cross_locality: false,
            requested_subloc: Cell::new(SUBLOC_ANY),
            entry_fn: None,
            args: None,
            prv: RefCell::new(PrivateData::default()),
        }
    }

    /// Descriptor carrying a caller defined argument bundle, read back with
    /// [`TaskDescriptor::args`].
    pub fn with_args<T: Any + Send>(args: T) -> Self {
        Self {
            args: Some(Box::new(args)),
            ..Self::new()
        }
    }

    pub fn serial_state(&self) -> bool {
        self.serial_state.get()
    }

    pub fn set_serial_state(&self, serial: bool) {
        self.serial_state.set(serial);
    }

    pub fn count_running(&self) -> bool {
        self.count_running
    }

    pub fn is_cross_locality(&self) -> bool {
        self.is_cross_locality
    }

    pub fn requested_subloc(&self) -> SubLoc {
        self.requested_subloc.get()
    }

    pub fn set_requested_subloc(&self, subloc: SubLoc) {
        self.requested_subloc.set(subloc);
    }

    pub fn entry_fn(&self) -> Option<TaskFn> {
        self.entry_fn
    }

    pub fn args<T: Any>(&self) -> Option<&T> {
        self.args.as_deref().and_then(|args| args.downcast_ref())
    }

    /// Mutable access to the private data slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is already borrowed, i.e. on a nested call for the
    /// same descriptor.
    pub fn private_data(&self) -> RefMut<'_, PrivateData> {
        self.prv.borrow_mut()
    }

    /// Snapshot of the scheduling fields, comparable with `==`.
    pub fn fields(&self) -> DescriptorFields {
        DescriptorFields {
            serial_state: self.serial_state(),
            count_running: self.count_running,
            is_cross_locality: self.is_cross_locality,
            requested_subloc: self.requested_subloc(),
        }
    }

    /// Fills the scheduling fields before the descriptor is moved into a new
    /// task. The private slot always starts out empty.
    pub(crate) fn prepare(
        &mut self,
        entry: TaskFn,
        subloc: SubLoc,
        count_running: bool,
        is_cross_locality: bool,
        serial_state: bool,
    ) {
        self.serial_state.set(serial_state);
        self.count_running = count_running;
        self.is_cross_locality = is_cross_locality;
        self.requested_subloc.set(subloc);
        self.entry_fn = Some(entry);
        self.prv.get_mut().clear();
    }
}

impl Default for TaskDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDescriptor")
            .field("serial_state", &self.serial_state())
            .field("count_running", &self.count_running)
            .field("is_cross_locality", &self.is_cross_locality)
            .field("requested_subloc", &self.requested_subloc())
            .field("has_entry_fn", &self.entry_fn.is_some())
            .field("has_args", &self.args.is_some())
            .finish()
    }
}

/// Plain copy of a descriptor's scheduling fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorFields {
    pub serial_state: bool,
    pub count_running: bool,
    pub is_cross_locality: bool,
    pub requested_subloc: SubLoc,
}

impl Default for DescriptorFields {
    fn default() -> Self {
        TaskDescriptor::new().fields()
    }
}
