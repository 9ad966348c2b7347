//! Per-request correlation of kernel responses.
//!
//! A [`KernelFuture`] is created for every shell request. It collects the
//! shell reply, iopub output and stdin input requests whose parent header
//! names the request, and completes once both the reply and the kernel's
//! `idle` status for that request have been seen, in either order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::wire::message::{Channel, ProtocolMessage};

type Callback = Box<dyn FnMut(&ProtocolMessage) + Send>;
type DetachHook = Box<dyn FnOnce(&str) + Send>;

/// Lifecycle flags of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FutureFlags {
    pub got_reply: bool,
    pub got_idle: bool,
    pub auto_dispose: bool,
    pub is_done: bool,
}

/// Terminal outcome observed by [`KernelFuture::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Done,
    /// Disposed before both the reply and idle status arrived.
    Disposed,
}

#[derive(Clone, Copy)]
enum Slot {
    Reply,
    Output,
    Input,
}

#[derive(Default)]
struct Inner {
    flags: FutureFlags,
    disposed: bool,
    on_reply: Option<Callback>,
    on_output: Option<Callback>,
    on_input: Option<Callback>,
    on_done: Option<Callback>,
    reply: Option<Arc<ProtocolMessage>>,
    detach: Option<DetachHook>,
}

impl Inner {
    fn slot(&mut self, slot: Slot) -> &mut Option<Callback> {
        match slot {
            Slot::Reply => &mut self.on_reply,
            Slot::Output => &mut self.on_output,
            Slot::Input => &mut self.on_input,
        }
    }
}

struct Shared {
    msg_id: String,
    inner: Mutex<Inner>,
    completion: watch::Sender<Completion>,
}

/// Handle to an in-flight kernel request.
///
/// Clones share state; the engine keeps one clone in its pending table until
/// the future is disposed.
#[derive(Clone)]
pub struct KernelFuture {
    shared: Arc<Shared>,
}

impl KernelFuture {
    /// `detach` runs once, on disposal, with the request's message id.
    pub(crate) fn new(msg_id: impl Into<String>, detach: impl FnOnce(&str) + Send + 'static) -> Self {
        let (completion, _) = watch::channel(Completion::Pending);
        Self {
            shared: Arc::new(Shared {
                msg_id: msg_id.into(),
                inner: Mutex::new(Inner {
                    detach: Some(Box::new(detach)),
                    ..Inner::default()
                }),
                completion,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn msg_id(&self) -> &str {
        &self.shared.msg_id
    }

    pub fn flags(&self) -> FutureFlags {
        self.lock().flags
    }

    pub fn is_done(&self) -> bool {
        self.lock().flags.is_done
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// The shell reply, once received.
    pub fn reply(&self) -> Option<Arc<ProtocolMessage>> {
        self.lock().reply.clone()
    }

    /// Current completion without waiting.
    pub fn completion(&self) -> Completion {
        *self.shared.completion.borrow()
    }

    /// Dispose automatically once done.
    pub fn set_auto_dispose(&self, value: bool) -> &Self {
        self.lock().flags.auto_dispose = value;
        self
    }

    pub fn on_reply(&self, callback: impl FnMut(&ProtocolMessage) + Send + 'static) -> &Self {
        self.set_callback(Some(Slot::Reply), Box::new(callback))
    }

    pub fn on_output(&self, callback: impl FnMut(&ProtocolMessage) + Send + 'static) -> &Self {
        self.set_callback(Some(Slot::Output), Box::new(callback))
    }

    pub fn on_input(&self, callback: impl FnMut(&ProtocolMessage) + Send + 'static) -> &Self {
        self.set_callback(Some(Slot::Input), Box::new(callback))
    }

    /// Runs at most once, with the message that completed the request.
    pub fn on_done(&self, callback: impl FnMut(&ProtocolMessage) + Send + 'static) -> &Self {
        self.set_callback(None, Box::new(callback))
    }

    fn set_callback(&self, slot: Option<Slot>, callback: Callback) -> &Self {
        let mut inner = self.lock();
        if inner.disposed {
            return self;
        }
        match slot {
            Some(slot) => *inner.slot(slot) = Some(callback),
            None => inner.on_done = Some(callback),
        }
        self
    }

    /// Resolves when the request is done or disposed.
    pub async fn wait(&self) -> Completion {
        let mut rx = self.shared.completion.subscribe();
        match rx.wait_for(|c| *c != Completion::Pending).await {
            Ok(completion) => *completion,
            Err(_) => Completion::Disposed,
        }
    }

    /// Route one inbound message that names this request as its parent.
    pub fn handle_message(&self, msg: &Arc<ProtocolMessage>) {
        if self.is_disposed() {
            return;
        }
        match msg.channel {
            Channel::Iopub => {
                self.invoke(Slot::Output, msg);
                if msg.is_idle_status() {
                    let got_reply = {
                        let mut inner = self.lock();
                        if inner.disposed {
                            return;
                        }
                        inner.flags.got_idle = true;
                        inner.flags.got_reply
                    };
                    if got_reply {
                        self.handle_done(msg);
                    }
                }
            }
            Channel::Shell => {
                self.lock().reply = Some(Arc::clone(msg));
                self.invoke(Slot::Reply, msg);
                let got_idle = {
                    let mut inner = self.lock();
                    if inner.disposed {
                        return;
                    }
                    inner.flags.got_reply = true;
                    inner.flags.got_idle
                };
                if got_idle {
                    self.handle_done(msg);
                }
            }
            Channel::Stdin => self.invoke(Slot::Input, msg),
        }
    }

    // Callbacks run unlocked so they can touch this future. A callback is
    // restored only if it was neither replaced nor disposed meanwhile.
    fn invoke(&self, slot: Slot, msg: &ProtocolMessage) {
        let Some(mut callback) = self.lock().slot(slot).take() else {
            return;
        };
        callback(msg);
        let mut inner = self.lock();
        if !inner.disposed {
            let current = inner.slot(slot);
            if current.is_none() {
                *current = Some(callback);
            }
        }
    }

    fn handle_done(&self, msg: &ProtocolMessage) {
        let on_done = {
            let mut inner = self.lock();
            if inner.flags.is_done {
                return;
            }
            inner.flags.is_done = true;
            inner.on_reply = None;
            inner.on_input = None;
            inner.on_done.take()
        };
        if let Some(mut callback) = on_done {
            callback(msg);
        }
        self.shared.completion.send_replace(Completion::Done);
        tracing::trace!(msg_id = %self.shared.msg_id, "Kernel request done");

        let auto_dispose = self.lock().flags.auto_dispose;
        if auto_dispose {
            self.dispose();
        }
    }

    /// Release callbacks and detach from the engine. Idempotent.
    pub fn dispose(&self) {
        let (detach, was_done) = {
            let mut inner = self.lock();
            if inner.disposed {
                return;
            }
            inner.disposed = true;
            inner.on_reply = None;
            inner.on_output = None;
            inner.on_input = None;
            inner.on_done = None;
            (inner.detach.take(), inner.flags.is_done)
        };
        if !was_done {
            self.shared.completion.send_replace(Completion::Disposed);
        }
        if let Some(detach) = detach {
            detach(&self.shared.msg_id);
        }
    }
}

impl std::fmt::Debug for KernelFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("KernelFuture")
            .field("msg_id", &self.shared.msg_id)
            .field("flags", &inner.flags)
            .field("disposed", &inner.disposed)
            .finish()
    }
}
