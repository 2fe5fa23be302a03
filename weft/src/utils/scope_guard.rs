/// Runs a closure when dropped, on normal exit or while unwinding.
///
/// Worker threads use it to clear their thread-local context however the
/// event loop exits, and runtime init uses it to roll back a half-built
/// context when a later step fails.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub(crate) fn new(on_drop: F) -> Self {
        Self {
            on_drop: Some(on_drop),
        }
    }

    /// The closure will not run.
    pub(crate) fn disarm(&mut self) {
        self.on_drop = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}
