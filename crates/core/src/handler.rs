//! Event handler capability invoked by the event processor.

use crate::{DeletedObject, PodObject};

/// Synchronous callbacks for cache changes. Return values are not consumed;
/// a panicking callback is caught and logged by the processor.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, obj: &PodObject);
    fn on_update(&self, old: Option<&PodObject>, new: &PodObject);
    fn on_delete(&self, obj: &DeletedObject);
}

type AddFn = Box<dyn Fn(&PodObject) + Send + Sync>;
type UpdateFn = Box<dyn Fn(Option<&PodObject>, &PodObject) + Send + Sync>;
type DeleteFn = Box<dyn Fn(&DeletedObject) + Send + Sync>;

/// Closure-based handler; unset callbacks are no-ops.
#[derive(Default)]
pub struct ResourceEventHandlerFns {
    add: Option<AddFn>,
    update: Option<UpdateFn>,
    delete: Option<DeleteFn>,
}

impl ResourceEventHandlerFns {
    pub fn new() -> Self { Self::default() }

    pub fn with_add(mut self, f: impl Fn(&PodObject) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn with_update(mut self, f: impl Fn(Option<&PodObject>, &PodObject) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn with_delete(mut self, f: impl Fn(&DeletedObject) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ResourceEventHandlerFns {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEventHandlerFns")
            .field("add", &self.add.is_some())
            .field("update", &self.update.is_some())
            .field("delete", &self.delete.is_some())
            .finish()
    }
}

impl ResourceEventHandler for ResourceEventHandlerFns {
    fn on_add(&self, obj: &PodObject) {
        if let Some(f) = &self.add { f(obj) }
    }

    fn on_update(&self, old: Option<&PodObject>, new: &PodObject) {
        if let Some(f) = &self.update { f(old, new) }
    }

    fn on_delete(&self, obj: &DeletedObject) {
        if let Some(f) = &self.delete { f(obj) }
    }
}
