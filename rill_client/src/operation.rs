//! Handles to pending requests.

use core::{cell::RefCell, fmt};
use std::rc::Rc;

use rill_proto::message::{BufferAttr, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    Running,
    Done,
    Cancelled,
}

/// Outcome of a finished operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub success: bool,
    /// Set when the server refused the request, or it timed out.
    pub error: Option<ErrorCode>,
    /// Buffer metrics the server settled on, for buffer metric updates.
    pub buffer_attr: Option<BufferAttr>,
}

impl Completion {
    #[inline(always)]
    pub(crate) const fn success(success: bool) -> Self {
        Self {
            success,
            error: None,
            buffer_attr: None,
        }
    }

    #[inline(always)]
    pub(crate) const fn failed(code: ErrorCode) -> Self {
        Self {
            success: false,
            error: Some(code),
            buffer_attr: None,
        }
    }
}

type Callback = Box<dyn FnOnce(&Completion)>;

struct Inner {
    state: OperationState,
    completion: Option<Completion>,
    callback: Option<Callback>,
}

/// A request in flight.
///
/// Clones share the same underlying operation. The handle stays usable after
/// its stream is gone; an operation whose stream was unlinked before the
/// reply arrived ends up [`Cancelled`](OperationState::Cancelled) without
/// ever completing.
#[derive(Clone)]
pub struct Operation(Rc<RefCell<Inner>>);

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Operation")
            .field("state", &inner.state)
            .field("completion", &inner.completion)
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub(crate) fn new() -> Self {
        Self(Rc::new(RefCell::new(Inner {
            state: OperationState::Running,
            completion: None,
            callback: None,
        })))
    }

    #[inline]
    pub fn state(&self) -> OperationState {
        self.0.borrow().state
    }

    /// The outcome, once the operation is [`Done`](OperationState::Done).
    #[inline]
    pub fn completion(&self) -> Option<Completion> {
        self.0.borrow().completion
    }

    /// Registers `f` to run on completion, replacing any previous callback.
    ///
    /// Runs `f` right away if the operation is already done. A cancelled
    /// operation never runs it.
    pub fn on_complete(&self, f: impl FnOnce(&Completion) + 'static) {
        let done = {
            let mut inner = self.0.borrow_mut();
            match inner.state {
                OperationState::Running => {
                    inner.callback = Some(Box::new(f));
                    return;
                }
                OperationState::Done => inner.completion,
                OperationState::Cancelled => return,
            }
        };

        if let Some(c) = done {
            f(&c);
        }
    }

    /// Stops the operation from ever completing.
    ///
    /// The request itself is not withdrawn from the server.
    pub fn cancel(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.state == OperationState::Running {
            inner.state = OperationState::Cancelled;
            inner.callback = None;
        }
    }

    pub(crate) fn complete(&self, completion: Completion) {
        let callback = {
            let mut inner = self.0.borrow_mut();
            if inner.state != OperationState::Running {
                return;
            }
            inner.state = OperationState::Done;
            inner.completion = Some(completion);
            inner.callback.take()
        };

        // the borrow is released, so the callback may inspect this handle
        if let Some(cb) = callback {
            cb(&completion);
        }
    }
}
