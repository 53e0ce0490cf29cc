use std::collections::HashMap;

use crate::error::UnhandledOperation;

/// A host-provided handler invoked by index (interrupt vector, I/O port,
/// callback stub id — spec.md §6 `CallbackHandler`).
pub trait CallbackHandler {
    fn invoke(&mut self) -> Result<(), UnhandledOperation>;
}

/// Maps small integer indices to registered handlers (spec.md §6
/// `IndexBasedDispatcher`), raising `UnhandledOperation` with `context` when
/// an index has no handler — used for both DOS/BIOS callback vectors and,
/// by the host wiring a `cfg-core::Bus` impl, I/O ports.
pub struct IndexBasedDispatcher<H> {
    context: &'static str,
    handlers: HashMap<u32, H>,
}

impl<H: CallbackHandler> IndexBasedDispatcher<H> {
    pub fn new(context: &'static str) -> Self {
        Self {
            context,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, index: u32, handler: H) {
        self.handlers.insert(index, handler);
    }

    pub fn unregister(&mut self, index: u32) -> Option<H> {
        self.handlers.remove(&index)
    }

    pub fn is_registered(&self, index: u32) -> bool {
        self.handlers.contains_key(&index)
    }

    pub fn dispatch(&mut self, index: u32) -> Result<(), UnhandledOperation> {
        match self.handlers.get_mut(&index) {
            Some(handler) => handler.invoke(),
            None => {
                tracing::debug!(context = self.context, index, "unhandled callback index");
                Err(UnhandledOperation::new(
                    self.context,
                    format!("no handler registered for index {index}"),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler {
        calls: u32,
    }

    impl CallbackHandler for CountingHandler {
        fn invoke(&mut self) -> Result<(), UnhandledOperation> {
            self.calls += 1;
            Ok(())
        }
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let mut dispatcher = IndexBasedDispatcher::new("callback");
        dispatcher.register(0x21, CountingHandler { calls: 0 });
        dispatcher.dispatch(0x21).unwrap();
        dispatcher.dispatch(0x21).unwrap();
        assert_eq!(dispatcher.handlers.get(&0x21).unwrap().calls, 2);
    }

    #[test]
    fn dispatch_on_unregistered_index_is_unhandled() {
        let mut dispatcher: IndexBasedDispatcher<CountingHandler> = IndexBasedDispatcher::new("callback");
        let err = dispatcher.dispatch(0x99).unwrap_err();
        assert_eq!(err.context, "callback");
    }
}
